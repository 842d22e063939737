//! Unix-socket listener for the helper.
//!
//! One task per connection, bounded by a semaphore. Requests on a single
//! connection are answered in order; connections run concurrently.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::protocol::{RequestFrame, Response, ResponseFrame, StatusReply, frame_codec};
use super::service::{Caller, HelperService};
use crate::concurrency::{InstanceLock, InstanceLockGuard};
use crate::config::{Config, RpcConfig};
use crate::security::{AuditAction, ErrorCode};

/// A bound, listening helper socket. Holds the instance lock until dropped.
pub struct RpcServer {
    service: Arc<HelperService>,
    listener: UnixListener,
    socket_path: PathBuf,
    settings: RpcConfig,
    _lock: InstanceLockGuard,
}

impl RpcServer {
    /// Take the instance lock, clear a stale socket and bind.
    /// Must be called inside a Tokio runtime.
    pub fn bind(service: Arc<HelperService>, config: &Config) -> Result<Self> {
        let lock = InstanceLock::new(config.paths.instance_lock());
        let Some(guard) = lock.try_acquire()? else {
            match lock.holder_pid() {
                Some(pid) => bail!("sweep-helper is already running (pid {pid})"),
                None => bail!("sweep-helper is already running"),
            }
        };

        let socket_path = config.socket_path();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        cleanup_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(config.rpc.socket_mode),
        )
        .with_context(|| {
            format!(
                "Failed to set socket permissions on {}",
                socket_path.display()
            )
        })?;

        Ok(Self {
            service,
            listener,
            socket_path,
            settings: config.rpc.clone(),
            _lock: guard,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then abort open connections and
    /// remove the socket file.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let limit = Arc::new(Semaphore::new(self.settings.max_connections));
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        info!(socket = %self.socket_path.display(), version = self.service.version(), "listening");
        self.service.audit().record(
            AuditAction::ServerStarted,
            None,
            "local",
            Some(&format!("pid {}", std::process::id())),
        )
        .await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        warn!("connection task panicked: {e}");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let Ok(permit) = limit.clone().try_acquire_owned() else {
                            warn!("connection limit reached, dropping client");
                            continue;
                        };
                        let service = self.service.clone();
                        let settings = self.settings.clone();
                        connections.spawn(async move {
                            let _permit = permit;
                            if let Err(e) = serve_connection(service, stream, &settings).await {
                                debug!("connection closed: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        connections.shutdown().await;
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(path = %self.socket_path.display(), "socket already gone: {e}");
        }
        Ok(())
    }
}

/// Remove a leftover socket file. Anything else at the path is an error.
fn cleanup_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    };
    if !metadata.file_type().is_socket() {
        bail!("{} exists but is not a socket", path.display());
    }
    std::fs::remove_file(path)
        .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

fn peer_allowed(allowed: &[u32], uid: Option<u32>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    uid.is_some_and(|uid| allowed.contains(&uid))
}

async fn serve_connection(
    service: Arc<HelperService>,
    stream: UnixStream,
    settings: &RpcConfig,
) -> Result<()> {
    let caller = match stream.peer_cred() {
        Ok(cred) => Caller {
            uid: Some(cred.uid()),
            pid: cred.pid(),
        },
        Err(e) => {
            warn!("peer credentials unavailable: {e}");
            Caller::default()
        }
    };
    let peer = caller.label();

    if !peer_allowed(&settings.allowed_peer_uids, caller.uid) {
        warn!(peer = %peer, "rejecting peer");
        service.audit().record(
            AuditAction::PeerRejected,
            Some(ErrorCode::PermissionDenied),
            &peer,
            None,
        )
        .await;
        return Ok(());
    }
    debug!(peer = %peer, "client connected");

    let (read, write) = stream.into_split();
    let mut requests = FramedRead::new(read, frame_codec(settings.max_request_bytes));
    let mut responses = FramedWrite::new(write, frame_codec(settings.max_response_bytes));

    while let Some(frame) = requests.next().await {
        let frame = frame.context("reading request frame")?;
        let reply = match serde_json::from_slice::<RequestFrame>(&frame) {
            Ok(RequestFrame { id, request }) => {
                debug!(id, op = request.op_name(), peer = %peer, "request");
                ResponseFrame {
                    id,
                    response: service.handle(request, &caller).await,
                }
            }
            Err(e) => {
                warn!(peer = %peer, "malformed request: {e}");
                ResponseFrame {
                    id: frame_id(&frame),
                    response: Response::Status(StatusReply::failed(
                        ErrorCode::Unknown,
                        format!("malformed request: {e}"),
                    )),
                }
            }
        };

        let mut encoded = serde_json::to_vec(&reply)?;
        if encoded.len() > settings.max_response_bytes {
            warn!(id = reply.id, size = encoded.len(), "response exceeds frame limit");
            encoded = serde_json::to_vec(&ResponseFrame {
                id: reply.id,
                response: Response::Status(StatusReply::failed(
                    ErrorCode::Unknown,
                    "response exceeds frame limit",
                )),
            })?;
        }
        responses
            .send(Bytes::from(encoded))
            .await
            .context("writing response frame")?;
    }

    debug!(peer = %peer, "client disconnected");
    Ok(())
}

/// Best-effort id recovery from a frame that failed to parse as a request.
fn frame_id(frame: &[u8]) -> u64 {
    serde_json::from_slice::<serde_json::Value>(frame)
        .ok()
        .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentMode;
    use crate::paths::Paths;
    use crate::security::{AllowlistScope, read_audit_log};
    use crate::server::client::HelperClient;
    use crate::server::protocol::Request;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct Running {
        _tmp: tempfile::TempDir,
        config: Config,
        root: PathBuf,
        stop: Option<oneshot::Sender<()>>,
        handle: JoinHandle<Result<()>>,
    }

    impl Running {
        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.handle.await.unwrap().unwrap();
        }
    }

    fn test_config(tweak: impl FnOnce(&mut Config)) -> (tempfile::TempDir, Config, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let root = base.join("Caches");
        std::fs::create_dir_all(&root).unwrap();

        let mut config = Config {
            paths: Paths::under(&base),
            ..Config::default()
        };
        config.paths.ensure_dirs().unwrap();
        config.environment.mode = EnvironmentMode::Test;
        config.allowlist.cleanup_roots = vec![root.to_str().unwrap().to_string()];
        config.allowlist.uninstall_roots = vec![];
        config.commands.test = vec!["/bin/echo".into()];
        tweak(&mut config);
        (tmp, config, root)
    }

    fn start(tweak: impl FnOnce(&mut Config)) -> Running {
        let (tmp, config, root) = test_config(tweak);
        let service = Arc::new(HelperService::from_config(&config).unwrap());
        let server = RpcServer::bind(service, &config).unwrap();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));
        Running {
            _tmp: tmp,
            config,
            root,
            stop: Some(tx),
            handle,
        }
    }

    fn status(response: Response) -> StatusReply {
        match response {
            Response::Status(reply) => reply,
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn serves_requests_over_the_socket() {
        let running = start(|_| {});
        let socket = running.config.socket_path();
        let mode = std::fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let mut client = HelperClient::connect(&socket).await.unwrap();
        assert_eq!(
            client.get_version().await.unwrap(),
            env!("CARGO_PKG_VERSION")
        );

        let target = running.root.join("stale.db");
        std::fs::write(&target, b"x").unwrap();
        let reply = status(
            client
                .call(Request::DeleteFile {
                    path: target.to_str().unwrap().into(),
                    scope: AllowlistScope::Cleanup,
                })
                .await
                .unwrap(),
        );
        assert!(reply.success, "{reply:?}");
        assert!(!target.exists());

        let reply = status(
            client
                .call(Request::RunCommand {
                    name: "/bin/echo".into(),
                    arguments: vec!["over".into(), "socket".into()],
                })
                .await
                .unwrap(),
        );
        assert_eq!(reply.execution.unwrap().stdout, b"over socket\n");

        let reply = status(
            client
                .call(Request::RunCommand {
                    name: "/bin/rm".into(),
                    arguments: vec!["-rf".into(), "/".into()],
                })
                .await
                .unwrap(),
        );
        assert_eq!(reply.error, Some(ErrorCode::CommandNotAllowlisted));

        drop(client);
        running.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let running = start(|_| {});
        let stream = UnixStream::connect(running.config.socket_path())
            .await
            .unwrap();
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, frame_codec(1 << 20));
        let mut writer = FramedWrite::new(write, frame_codec(1 << 20));

        writer
            .send(Bytes::from_static(br#"{"id":9,"request":{"op":"format_disk"}}"#))
            .await
            .unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        let reply: ResponseFrame = serde_json::from_slice(&frame).unwrap();
        assert_eq!(reply.id, 9);
        assert_eq!(reply.response.error(), Some(ErrorCode::Unknown));

        // Connection stays usable.
        writer
            .send(Bytes::from_static(br#"{"id":10,"request":{"op":"get_version"}}"#))
            .await
            .unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        let reply: ResponseFrame = serde_json::from_slice(&frame).unwrap();
        assert_eq!(reply.id, 10);

        drop((reader, writer));
        running.stop().await;
    }

    #[tokio::test]
    async fn oversized_request_closes_connection() {
        let running = start(|c| c.rpc.max_request_bytes = 1024);
        let stream = UnixStream::connect(running.config.socket_path())
            .await
            .unwrap();
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, frame_codec(1 << 20));
        let mut writer = FramedWrite::new(write, frame_codec(1 << 20));

        let _ = writer.send(Bytes::from(vec![b' '; 4096])).await;
        let next = reader.next().await;
        assert!(matches!(next, None | Some(Err(_))), "{next:?}");

        drop((reader, writer));
        running.stop().await;
    }

    #[tokio::test]
    async fn rejected_peer_is_disconnected_and_audited() {
        let other_uid = nix::unistd::getuid().as_raw().wrapping_add(1);
        let running = start(|c| c.rpc.allowed_peer_uids = vec![other_uid]);

        let mut client = HelperClient::connect(&running.config.socket_path())
            .await
            .unwrap();
        assert!(client.get_version().await.is_err());

        let entries = read_audit_log(&running.config.paths.state_dir).unwrap();
        assert!(
            entries
                .iter()
                .any(|e| e.action == AuditAction::PeerRejected)
        );

        drop(client);
        running.stop().await;
    }

    #[tokio::test]
    async fn allowed_peer_is_served() {
        let uid = nix::unistd::getuid().as_raw();
        let running = start(|c| c.rpc.allowed_peer_uids = vec![uid]);
        let mut client = HelperClient::connect(&running.config.socket_path())
            .await
            .unwrap();
        assert!(client.get_version().await.is_ok());
        drop(client);
        running.stop().await;
    }

    #[tokio::test]
    async fn concurrent_clients_are_independent() {
        let running = start(|_| {});
        let socket = running.config.socket_path();

        let mut calls = Vec::new();
        for i in 0..4 {
            let socket = socket.clone();
            calls.push(tokio::spawn(async move {
                let mut client = HelperClient::connect(&socket).await.unwrap();
                let reply = client
                    .run_command("/bin/echo", &[format!("client-{i}")])
                    .await
                    .unwrap();
                (i, reply)
            }));
        }
        for call in calls {
            let (i, reply) = call.await.unwrap();
            assert!(reply.success);
            assert_eq!(
                reply.execution.unwrap().stdout,
                format!("client-{i}\n").into_bytes()
            );
        }
        running.stop().await;
    }

    #[tokio::test]
    async fn second_server_is_refused_while_first_runs() {
        let running = start(|_| {});
        let service = Arc::new(HelperService::from_config(&running.config).unwrap());
        let err = RpcServer::bind(service, &running.config)
            .err()
            .expect("second bind must fail");
        assert!(err.to_string().contains("already running"));

        // The live socket was not touched.
        assert!(
            HelperClient::connect(&running.config.socket_path())
                .await
                .is_ok()
        );
        running.stop().await;
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_and_removed_on_shutdown() {
        let (_tmp, config, _root) = test_config(|_| {});
        let socket = config.socket_path();
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let service = Arc::new(HelperService::from_config(&config).unwrap());
        let server = RpcServer::bind(service, &config).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));
        assert!(HelperClient::connect(&socket).await.is_ok());

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn refuses_to_replace_regular_file() {
        let (_tmp, config, _root) = test_config(|_| {});
        std::fs::write(config.socket_path(), b"not a socket").unwrap();

        let service = Arc::new(HelperService::from_config(&config).unwrap());
        let err = RpcServer::bind(service, &config).err().unwrap();
        assert!(err.to_string().contains("not a socket"));
        assert!(config.socket_path().exists());
    }

    #[test]
    fn peer_allowlist_rules() {
        assert!(peer_allowed(&[], None));
        assert!(peer_allowed(&[], Some(501)));
        assert!(peer_allowed(&[501], Some(501)));
        assert!(!peer_allowed(&[501], Some(502)));
        assert!(!peer_allowed(&[501], None));
    }

    #[test]
    fn frame_id_recovery() {
        assert_eq!(frame_id(br#"{"id":42,"request":{}}"#), 42);
        assert_eq!(frame_id(b"garbage"), 0);
    }
}

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use super::protocol::{Request, Response, StatusReply};
use crate::config::{Config, Invocation, OperationsConfig};
use crate::sandbox::{ExecutionLimits, ExecutionResult, ProcessExecutor};
use crate::security::{AllowlistScope, AuditAction, AuditLog, ErrorCode, SecureDeleter};

/// Identity of the process on the other end of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    pub uid: Option<u32>,
    pub pid: Option<i32>,
}

impl Caller {
    pub fn label(&self) -> String {
        match (self.uid, self.pid) {
            (Some(uid), Some(pid)) => format!("uid:{uid} pid:{pid}"),
            (Some(uid), None) => format!("uid:{uid}"),
            _ => "unknown".to_string(),
        }
    }
}

/// The privileged operations. Built once at startup and shared by `Arc`
/// across connections; holds only read-only configuration.
pub struct HelperService {
    deleter: SecureDeleter,
    executor: ProcessExecutor,
    operations: OperationsConfig,
    audit: AuditLog,
    version: String,
}

impl HelperService {
    pub fn new(
        deleter: SecureDeleter,
        executor: ProcessExecutor,
        operations: OperationsConfig,
        audit: AuditLog,
    ) -> Self {
        Self {
            deleter,
            executor,
            operations,
            audit,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let deleter = SecureDeleter::new(Arc::new(config.path_allowlist()?));
        let executor = ProcessExecutor::new(
            config.command_gate(),
            ExecutionLimits::from_config(&config.executor),
        );
        let audit = AuditLog::new(&config.paths.state_dir, config.audit.enabled);
        Ok(Self::new(
            deleter,
            executor,
            config.operations.clone(),
            audit,
        ))
    }

    pub fn executor(&self) -> &ProcessExecutor {
        &self.executor
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Dispatch one request. Never fails: every error becomes a status
    /// reply with its code.
    pub async fn handle(&self, request: Request, caller: &Caller) -> Response {
        let source = caller.label();
        match request {
            Request::FlushDns => Response::Status(
                self.run_operation(AuditAction::FlushDns, "flush DNS cache", &source)
                    .await,
            ),
            Request::RebuildSearchIndex => Response::Status(
                self.run_operation(
                    AuditAction::RebuildSearchIndex,
                    "rebuild search index",
                    &source,
                )
                .await,
            ),
            Request::PurgeMemory => Response::Status(
                self.run_operation(AuditAction::PurgeMemory, "purge memory", &source)
                    .await,
            ),
            Request::DeleteFile { path, scope } => {
                Response::Status(self.delete_file(&path, scope, &source).await)
            }
            Request::RunCommand { name, arguments } => {
                Response::Status(self.run_command(&name, &arguments, &source).await)
            }
            Request::GetVersion => Response::Version {
                version: self.version.clone(),
            },
        }
    }

    pub async fn delete_file(&self, path: &str, scope: AllowlistScope, source: &str) -> StatusReply {
        let deleter = self.deleter.clone();
        let raw = path.to_string();
        let outcome = tokio::task::spawn_blocking(move || deleter.delete(&raw, scope)).await;

        let reply = match outcome {
            Ok(Ok(deletion)) => {
                info!(path = %deletion.path, kind = ?deletion.kind, %scope, "deleted");
                StatusReply::ok(format!("deleted {}", deletion.path))
            }
            Ok(Err(e)) => {
                warn!(path, %scope, code = %e.code(), "delete refused: {e}");
                StatusReply::failed(e.code(), e.to_string())
            }
            Err(e) => {
                warn!(path, "delete task failed: {e}");
                StatusReply::failed(ErrorCode::Unknown, "delete task failed")
            }
        };

        let detail = format!("{scope} {path}");
        self.audit
            .record(AuditAction::DeleteFile, reply.error, source, Some(&detail))
            .await;
        reply
    }

    pub async fn run_command(&self, name: &str, arguments: &[String], source: &str) -> StatusReply {
        // Surface check: a name outside the allowlist never reaches the
        // executor. The executor repeats it together with the signature.
        if let Err(e) = self.executor.gate().allowlist().vet(name) {
            warn!(name, "run refused: {e}");
            self.audit
                .record(AuditAction::RunCommand, Some(e.code()), source, Some(name))
                .await;
            return StatusReply::failed(e.code(), e.to_string());
        }

        let result = self.executor.run(name, arguments).await;
        let reply = execution_reply(name, result);
        info!(name, success = reply.success, "{}", reply.message);

        let detail = command_line(name, arguments);
        self.audit
            .record(AuditAction::RunCommand, reply.error, source, Some(&detail))
            .await;
        reply
    }

    /// Run the fixed steps behind a maintenance operation, stopping at the
    /// first step that does not exit cleanly.
    async fn run_operation(&self, action: AuditAction, label: &str, source: &str) -> StatusReply {
        let steps = self.steps(action);
        let reply = if steps.is_empty() {
            warn!(operation = label, "no steps configured");
            StatusReply::failed(
                ErrorCode::CommandNotAllowlisted,
                format!("{label}: not available on this system"),
            )
        } else {
            self.run_steps(label, steps).await
        };

        if reply.success {
            info!(operation = label, "{}", reply.message);
        } else {
            warn!(operation = label, "{}", reply.message);
        }
        self.audit.record(action, reply.error, source, None).await;
        reply
    }

    async fn run_steps(&self, label: &str, steps: &[Invocation]) -> StatusReply {
        let mut last = None;
        for step in steps {
            if let Err(e) = self.executor.gate().allowlist().vet(&step.program) {
                return StatusReply::failed(e.code(), format!("{label}: {e}"));
            }
            let result = self.executor.run(&step.program, &step.args).await;
            if !result.is_success() {
                let mut reply = execution_reply(&step.program, result);
                reply.message = format!("{label}: {}", reply.message);
                return reply;
            }
            last = Some(result);
        }

        let reply = StatusReply::ok(format!("{label}: done"));
        match last {
            Some(result) => reply.with_execution(result),
            None => reply,
        }
    }

    fn steps(&self, action: AuditAction) -> &[Invocation] {
        match action {
            AuditAction::FlushDns => &self.operations.flush_dns,
            AuditAction::RebuildSearchIndex => &self.operations.rebuild_search_index,
            AuditAction::PurgeMemory => &self.operations.purge_memory,
            _ => &[],
        }
    }
}

fn execution_reply(program: &str, result: ExecutionResult) -> StatusReply {
    let message = format!("{program} {}", result.summary());
    let reply = if result.is_success() {
        StatusReply::ok(message)
    } else {
        StatusReply::failed(result.error.unwrap_or(ErrorCode::Unknown), message)
    };
    reply.with_execution(result)
}

fn command_line(name: &str, arguments: &[String]) -> String {
    std::iter::once(name)
        .chain(arguments.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::TerminationReason;
    use crate::security::{
        AcceptAllVerifier, CommandAllowlist, CommandGate, PathAllowlist, read_audit_log,
    };
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        state: PathBuf,
        service: HelperService,
    }

    fn fixture(operations: OperationsConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let root = base.join("Caches");
        let state = base.join("state");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&state).unwrap();

        let allowlist = PathAllowlist::new(
            vec![crate::security::normalize(root.to_str().unwrap()).unwrap()],
            vec![],
        );
        let gate = CommandGate::new(
            CommandAllowlist::new(["/bin/echo", "/bin/sh", "/bin/sleep"]),
            Arc::new(AcceptAllVerifier),
        );
        let limits = ExecutionLimits::default().with_timeout(Duration::from_secs(1));
        let service = HelperService::new(
            SecureDeleter::new(Arc::new(allowlist)),
            ProcessExecutor::new(gate, limits),
            operations,
            AuditLog::new(&state, true),
        );
        Fixture {
            _tmp: tmp,
            root,
            state,
            service,
        }
    }

    fn no_operations() -> OperationsConfig {
        OperationsConfig {
            flush_dns: vec![],
            rebuild_search_index: vec![],
            purge_memory: vec![],
        }
    }

    fn caller() -> Caller {
        Caller {
            uid: Some(501),
            pid: Some(42),
        }
    }

    fn status(response: Response) -> StatusReply {
        match response {
            Response::Status(reply) => reply,
            other => panic!("expected status, got {other:?}"),
        }
    }

    fn actions(state: &Path) -> Vec<(AuditAction, String)> {
        read_audit_log(state)
            .unwrap()
            .into_iter()
            .map(|e| (e.action, e.outcome))
            .collect()
    }

    #[tokio::test]
    async fn delete_allowed_file_is_audited() {
        let fx = fixture(no_operations());
        let target = fx.root.join("app.cache");
        std::fs::write(&target, b"x").unwrap();

        let reply = status(
            fx.service
                .handle(
                    Request::DeleteFile {
                        path: target.to_str().unwrap().into(),
                        scope: AllowlistScope::Cleanup,
                    },
                    &caller(),
                )
                .await,
        );
        assert!(reply.success, "{reply:?}");
        assert!(!target.exists());

        let entries = read_audit_log(&fx.state).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::DeleteFile);
        assert_eq!(entries[0].outcome, "ok");
        assert_eq!(entries[0].source, "uid:501 pid:42");
    }

    #[tokio::test]
    async fn traversal_out_of_root_is_refused() {
        let fx = fixture(no_operations());
        let sneaky = format!("{}/evil/../../etc/passwd", fx.root.display());

        let reply = status(
            fx.service
                .handle(
                    Request::DeleteFile {
                        path: sneaky,
                        scope: AllowlistScope::Cleanup,
                    },
                    &caller(),
                )
                .await,
        );
        assert!(!reply.success);
        assert_eq!(reply.error, Some(ErrorCode::PathNotAllowed));
        assert_eq!(
            actions(&fx.state),
            vec![(AuditAction::DeleteFile, "PathNotAllowed".to_string())]
        );
    }

    #[tokio::test]
    async fn run_command_returns_output() {
        let fx = fixture(no_operations());
        let reply = status(
            fx.service
                .handle(
                    Request::RunCommand {
                        name: "/bin/echo".into(),
                        arguments: vec!["hello".into()],
                    },
                    &caller(),
                )
                .await,
        );
        assert!(reply.success, "{reply:?}");
        let execution = reply.execution.unwrap();
        assert_eq!(execution.stdout, b"hello\n");
        assert_eq!(execution.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_command_outside_allowlist_never_spawns() {
        let fx = fixture(no_operations());
        let reply = status(
            fx.service
                .handle(
                    Request::RunCommand {
                        name: "/bin/rm".into(),
                        arguments: vec!["-rf".into(), "/".into()],
                    },
                    &caller(),
                )
                .await,
        );
        assert_eq!(reply.error, Some(ErrorCode::CommandNotAllowlisted));
        assert!(reply.execution.is_none());
        assert_eq!(fx.service.executor().probe().spawns(), 0);
        assert_eq!(
            actions(&fx.state),
            vec![(AuditAction::RunCommand, "CommandNotAllowlisted".to_string())]
        );
    }

    #[tokio::test]
    async fn run_command_timeout_reports_code() {
        let fx = fixture(no_operations());
        let reply = fx
            .service
            .run_command("/bin/sleep", &["5".to_string()], "test")
            .await;
        assert!(!reply.success);
        assert_eq!(reply.error, Some(ErrorCode::Timeout));
        let execution = reply.execution.unwrap();
        assert_eq!(execution.reason, TerminationReason::Timeout);
        assert!(execution.output_may_be_incomplete);
    }

    #[tokio::test]
    async fn operation_runs_steps_in_order() {
        let mut ops = no_operations();
        ops.flush_dns = vec![
            Invocation::new("/bin/echo", &["first"]),
            Invocation::new("/bin/echo", &["second"]),
        ];
        let fx = fixture(ops);

        let reply = status(fx.service.handle(Request::FlushDns, &caller()).await);
        assert!(reply.success, "{reply:?}");
        assert_eq!(reply.execution.unwrap().stdout, b"second\n");
        assert_eq!(fx.service.executor().probe().spawns(), 2);
        assert_eq!(
            actions(&fx.state),
            vec![(AuditAction::FlushDns, "ok".to_string())]
        );
    }

    #[tokio::test]
    async fn operation_stops_at_first_failing_step() {
        let mut ops = no_operations();
        ops.purge_memory = vec![
            Invocation::new("/bin/sh", &["-c", "exit 3"]),
            Invocation::new("/bin/echo", &["unreachable"]),
        ];
        let fx = fixture(ops);

        let reply = status(fx.service.handle(Request::PurgeMemory, &caller()).await);
        assert!(!reply.success);
        assert_eq!(reply.execution.as_ref().unwrap().exit_code, Some(3));
        assert!(reply.message.contains("exited with status 3"));
        assert_eq!(fx.service.executor().probe().spawns(), 1);
    }

    #[tokio::test]
    async fn operation_with_unlisted_step_is_refused() {
        let mut ops = no_operations();
        ops.rebuild_search_index = vec![Invocation::new("/usr/bin/mdutil", &["-E", "/"])];
        let fx = fixture(ops);

        let reply = status(
            fx.service
                .handle(Request::RebuildSearchIndex, &caller())
                .await,
        );
        assert_eq!(reply.error, Some(ErrorCode::CommandNotAllowlisted));
        assert_eq!(fx.service.executor().probe().spawns(), 0);
    }

    #[tokio::test]
    async fn unconfigured_operation_fails_cleanly() {
        let fx = fixture(no_operations());
        let reply = status(fx.service.handle(Request::FlushDns, &caller()).await);
        assert!(!reply.success);
        assert!(reply.message.contains("not available"));
    }

    #[tokio::test]
    async fn version_matches_package() {
        let fx = fixture(no_operations());
        let response = fx.service.handle(Request::GetVersion, &caller()).await;
        assert_eq!(
            response,
            Response::Version {
                version: env!("CARGO_PKG_VERSION").to_string()
            }
        );
        assert!(read_audit_log(&fx.state).unwrap().is_empty());
    }
}

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::protocol::{Request, RequestFrame, Response, ResponseFrame, StatusReply, frame_codec};
use crate::config::RpcConfig;
use crate::security::AllowlistScope;

/// Request/response client for the helper socket. One call in flight at a
/// time; open several clients for concurrency.
pub struct HelperClient {
    requests: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    responses: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    next_id: u64,
}

impl HelperClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        Self::connect_with(path, &RpcConfig::default()).await
    }

    /// Connect using the frame limits from `rpc`.
    pub async fn connect_with(path: &Path, rpc: &RpcConfig) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to {}", path.display()))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            requests: FramedWrite::new(write, frame_codec(rpc.max_request_bytes)),
            responses: FramedRead::new(read, frame_codec(rpc.max_response_bytes)),
            next_id: 1,
        })
    }

    pub async fn call(&mut self, request: Request) -> Result<Response> {
        let id = self.next_id;
        self.next_id += 1;

        let encoded = serde_json::to_vec(&RequestFrame { id, request })?;
        self.requests
            .send(Bytes::from(encoded))
            .await
            .context("Failed to send request")?;

        let frame = match self.responses.next().await {
            Some(frame) => frame.context("Failed to read response")?,
            None => bail!("helper closed the connection"),
        };
        let reply: ResponseFrame =
            serde_json::from_slice(&frame).context("Malformed response from helper")?;
        if reply.id != id {
            bail!("response id {} does not match request id {id}", reply.id);
        }
        Ok(reply.response)
    }

    pub async fn get_version(&mut self) -> Result<String> {
        match self.call(Request::GetVersion).await? {
            Response::Version { version } => Ok(version),
            other => bail!("unexpected reply to get_version: {other:?}"),
        }
    }

    pub async fn flush_dns(&mut self) -> Result<StatusReply> {
        self.status(Request::FlushDns).await
    }

    pub async fn rebuild_search_index(&mut self) -> Result<StatusReply> {
        self.status(Request::RebuildSearchIndex).await
    }

    pub async fn purge_memory(&mut self) -> Result<StatusReply> {
        self.status(Request::PurgeMemory).await
    }

    pub async fn delete_file(&mut self, path: &str, scope: AllowlistScope) -> Result<StatusReply> {
        self.status(Request::DeleteFile {
            path: path.to_string(),
            scope,
        })
        .await
    }

    pub async fn run_command(&mut self, name: &str, arguments: &[String]) -> Result<StatusReply> {
        self.status(Request::RunCommand {
            name: name.to_string(),
            arguments: arguments.to_vec(),
        })
        .await
    }

    async fn status(&mut self, request: Request) -> Result<StatusReply> {
        match self.call(request).await? {
            Response::Status(reply) => Ok(reply),
            other => bail!("unexpected reply: {other:?}"),
        }
    }
}

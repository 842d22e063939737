//! Wire types for the helper socket.
//!
//! Every frame is a 4-byte big-endian length followed by one JSON document.
//! A client sends [`RequestFrame`]s and receives exactly one
//! [`ResponseFrame`] per request, carrying the same `id`.

use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::sandbox::ExecutionResult;
use crate::security::{AllowlistScope, ErrorCode};

/// The complete set of privileged operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    FlushDns,
    RebuildSearchIndex,
    PurgeMemory,
    DeleteFile {
        path: String,
        #[serde(default)]
        scope: AllowlistScope,
    },
    RunCommand {
        name: String,
        #[serde(default)]
        arguments: Vec<String>,
    },
    GetVersion,
}

impl Request {
    /// Short operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::FlushDns => "flush_dns",
            Request::RebuildSearchIndex => "rebuild_search_index",
            Request::PurgeMemory => "purge_memory",
            Request::DeleteFile { .. } => "delete_file",
            Request::RunCommand { .. } => "run_command",
            Request::GetVersion => "get_version",
        }
    }
}

/// Outcome of every operation except `get_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    /// Captured output of the last program run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
}

impl StatusReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            execution: None,
        }
    }

    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(code),
            execution: None,
        }
    }

    pub fn with_execution(mut self, execution: ExecutionResult) -> Self {
        self.execution = Some(execution);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Status(StatusReply),
    Version { version: String },
}

impl Response {
    /// Error code carried by a failed status reply.
    pub fn error(&self) -> Option<ErrorCode> {
        match self {
            Response::Status(reply) => reply.error,
            Response::Version { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: Response,
}

/// Length-prefixed codec capped at `max_frame` bytes in both directions.
pub fn frame_codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame)
        .new_codec()
}

use serde::{Deserialize, Serialize};

use crate::security::ErrorCode;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "signal", rename_all = "snake_case")]
pub enum TerminationReason {
    Exit,
    Signal(i32),
    Timeout,
    StartFailed,
}

/// The single, final outcome of one `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Present for `Exit` (the status) and `Signal` (128 + signal).
    pub exit_code: Option<i32>,
    /// Raw status: exit status or signal number.
    pub termination_status: Option<i32>,
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub output_may_be_incomplete: bool,
    pub reason: TerminationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl ExecutionResult {
    /// Nothing was spawned.
    pub fn start_failed(code: ErrorCode) -> Self {
        Self {
            exit_code: None,
            termination_status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            output_may_be_incomplete: false,
            reason: TerminationReason::StartFailed,
            error: Some(code),
        }
    }

    /// Exited on its own with status 0.
    pub fn is_success(&self) -> bool {
        self.reason == TerminationReason::Exit && self.exit_code == Some(0)
    }

    /// One-line description for replies and logs.
    pub fn summary(&self) -> String {
        match self.reason {
            TerminationReason::Exit => match self.exit_code {
                Some(code) => format!("exited with status {code}"),
                None => "exited".to_string(),
            },
            TerminationReason::Signal(sig) => format!("terminated by signal {sig}"),
            TerminationReason::Timeout => "timed out".to_string(),
            TerminationReason::StartFailed => match self.error {
                Some(code) => format!("not started: {code}"),
                None => "not started".to_string(),
            },
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_failed_has_no_exit_code() {
        let result = ExecutionResult::start_failed(ErrorCode::CommandNotAllowlisted);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.reason, TerminationReason::StartFailed);
        assert!(!result.is_success());
        assert_eq!(result.summary(), "not started: CommandNotAllowlisted");
    }

    #[test]
    fn wire_shape() {
        let result = ExecutionResult {
            exit_code: Some(137),
            termination_status: Some(9),
            stdout: b"hi\n".to_vec(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            output_may_be_incomplete: false,
            reason: TerminationReason::Signal(9),
            error: None,
        };
        let json: serde_json::Value = serde_json::to_value(&result).unwrap();
        assert_eq!(json["stdout"], "aGkK");
        assert_eq!(json["reason"]["kind"], "signal");
        assert_eq!(json["reason"]["signal"], 9);
        assert!(json.get("error").is_none());

        let back: ExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn unit_reasons_serialize_as_kind_only() {
        let json = serde_json::to_string(&TerminationReason::Timeout).unwrap();
        assert_eq!(json, r#"{"kind":"timeout"}"#);
    }
}

use std::time::Duration;

use crate::config::ExecutorConfig;

/// Bounds applied to every child the executor starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock limit before the timer marks the run as timed out.
    pub timeout: Duration,

    /// Per-stream capture cap. Bytes beyond it are read and dropped.
    pub max_output_bytes: usize,

    /// SIGTERM to SIGKILL delay.
    pub kill_grace: Duration,

    /// Read window after exit while a descendant still holds a pipe.
    pub drain_grace: Duration,

    /// Added to `timeout + kill_grace` for the caller's outer wait.
    pub finalize_slack: Duration,

    /// RLIMIT_NOFILE for the child.
    pub max_open_files: u64,

    /// Complete child environment.
    pub env: Vec<(String, String)>,
}

impl ExecutionLimits {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_output_bytes: config.max_output_bytes,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            drain_grace: Duration::from_millis(config.drain_grace_ms),
            finalize_slack: Duration::from_millis(config.finalize_slack_ms),
            max_open_files: config.max_open_files,
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_max_output_bytes(mut self, cap: usize) -> Self {
        self.max_output_bytes = cap;
        self
    }

    /// Longest a caller of `run` can be kept waiting.
    pub fn outer_bound(&self) -> Duration {
        self.timeout + self.kill_grace + self.finalize_slack
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_follow_config() {
        let config = ExecutorConfig {
            timeout_secs: 7,
            max_output_bytes: 4096,
            kill_grace_ms: 100,
            finalize_slack_ms: 900,
            ..ExecutorConfig::default()
        };
        let limits = ExecutionLimits::from_config(&config);
        assert_eq!(limits.timeout, Duration::from_secs(7));
        assert_eq!(limits.max_output_bytes, 4096);
        assert_eq!(limits.outer_bound(), Duration::from_secs(8));
    }

    #[test]
    fn default_env_is_minimal() {
        let limits = ExecutionLimits::default();
        let keys: Vec<&str> = limits.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["LANG", "PATH"]);
    }

    #[test]
    fn builders_override_single_fields() {
        let limits = ExecutionLimits::default()
            .with_timeout(Duration::from_millis(250))
            .with_max_output_bytes(10);
        assert_eq!(limits.timeout, Duration::from_millis(250));
        assert_eq!(limits.max_output_bytes, 10);
        assert_eq!(limits.kill_grace, Duration::from_millis(200));
    }
}

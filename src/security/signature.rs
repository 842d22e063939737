//! Code-signature verification for allowlisted executables.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decides whether a canonical executable may be run.
///
/// Implementations are called from a blocking context and must return
/// within a bounded time.
#[cfg_attr(test, mockall::automock)]
pub trait SignatureVerifier: Send + Sync {
    /// `Err` carries a human-readable reason.
    fn verify(&self, path: &Path) -> Result<(), String>;

    /// Short label for logs and `check` output.
    fn describe(&self) -> String;
}

/// Accepts every binary. Test and development configurations only.
#[derive(Debug, Default)]
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _path: &Path) -> Result<(), String> {
        Ok(())
    }

    fn describe(&self) -> String {
        "accept-all".to_string()
    }
}

const CODESIGN: &str = "/usr/bin/codesign";
const DEFAULT_REQUIREMENT: &str = "anchor apple";

/// Runs `codesign --verify --strict -R=<requirement>` against the binary.
#[derive(Debug, Clone)]
pub struct CodesignVerifier {
    requirement: String,
    timeout: Duration,
}

impl Default for CodesignVerifier {
    fn default() -> Self {
        Self {
            requirement: DEFAULT_REQUIREMENT.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl CodesignVerifier {
    pub fn new(requirement: impl Into<String>, timeout: Duration) -> Self {
        Self {
            requirement: requirement.into(),
            timeout,
        }
    }
}

impl SignatureVerifier for CodesignVerifier {
    fn verify(&self, path: &Path) -> Result<(), String> {
        let mut child = Command::new(CODESIGN)
            .arg("--verify")
            .arg("--strict")
            .arg(format!("-R={}", self.requirement))
            .arg(path)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("cannot run {CODESIGN}: {e}"))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(format!("does not satisfy '{}' ({status})", self.requirement));
                }
                Ok(None) => {}
                Err(e) => return Err(format!("waiting for {CODESIGN}: {e}")),
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!(
                    "{CODESIGN} did not finish within {}s",
                    self.timeout.as_secs()
                ));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn describe(&self) -> String {
        format!("codesign ({})", self.requirement)
    }
}

/// Compares the SHA-256 of the binary against a pinned digest.
///
/// For platforms without a system signing authority. A binary with no pin
/// is rejected.
#[derive(Debug, Clone, Default)]
pub struct DigestPinVerifier {
    pins: HashMap<PathBuf, String>,
}

impl DigestPinVerifier {
    /// Keys are canonicalized where possible so pins written against a
    /// symlinked path still match. Digests are compared case-insensitively.
    pub fn new(pins: &HashMap<String, String>) -> Self {
        let pins = pins
            .iter()
            .map(|(path, digest)| {
                let path = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
                (path, digest.trim().to_ascii_lowercase())
            })
            .collect();
        Self { pins }
    }
}

impl SignatureVerifier for DigestPinVerifier {
    fn verify(&self, path: &Path) -> Result<(), String> {
        let expected = self
            .pins
            .get(path)
            .ok_or_else(|| "no pinned digest".to_string())?;
        let actual = file_sha256(path).map_err(|e| format!("cannot hash: {e}"))?;
        if &actual == expected {
            Ok(())
        } else {
            Err(format!("digest mismatch (got {actual})"))
        }
    }

    fn describe(&self) -> String {
        format!("sha256 pins ({} binaries)", self.pins.len())
    }
}

/// Hex SHA-256 of a file, streamed.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verifier for production: digest pins when any are configured or there
/// is no `codesign` on this platform, otherwise `codesign` with the given
/// requirement and timeout.
pub fn platform_verifier(
    pins: &HashMap<String, String>,
    requirement: &str,
    timeout: Duration,
) -> Arc<dyn SignatureVerifier> {
    if cfg!(target_os = "macos") && pins.is_empty() {
        Arc::new(CodesignVerifier::new(requirement, timeout))
    } else {
        Arc::new(DigestPinVerifier::new(pins))
    }
}

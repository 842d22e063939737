//! Executable allowlist and the signature gate in front of every spawn.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::errors::HelperError;
use super::signature::SignatureVerifier;

/// Fixed set of canonical executable paths.
#[derive(Debug, Clone, Default)]
pub struct CommandAllowlist {
    entries: BTreeSet<PathBuf>,
}

impl CommandAllowlist {
    /// Canonicalize every entry. Entries missing on this system are
    /// skipped with a warning, so a shared config works across hosts.
    pub fn new<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical = BTreeSet::new();
        for entry in entries {
            let entry = entry.as_ref();
            if !entry.is_absolute() {
                warn!(entry = %entry.display(), "ignoring relative command allowlist entry");
                continue;
            }
            match std::fs::canonicalize(entry) {
                Ok(path) => {
                    canonical.insert(path);
                }
                Err(e) => {
                    warn!(entry = %entry.display(), error = %e, "command allowlist entry not found");
                }
            }
        }
        Self { entries: canonical }
    }

    pub fn entries(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `requested` and check membership.
    ///
    /// Bare names are rejected rather than looked up on `$PATH`.
    pub fn vet(&self, requested: &str) -> Result<VettedCommand, HelperError> {
        let rejected = || HelperError::CommandNotAllowlisted {
            executable: requested.to_string(),
        };

        if requested.is_empty() || requested.contains('\0') || !requested.starts_with('/') {
            return Err(rejected());
        }
        let canonical = std::fs::canonicalize(requested).map_err(|_| rejected())?;
        if !self.entries.contains(&canonical) {
            return Err(rejected());
        }

        Ok(VettedCommand {
            requested: PathBuf::from(requested),
            canonical,
        })
    }
}

/// An executable that passed the allowlist and signature check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VettedCommand {
    /// Path as the caller named it; becomes `argv[0]`.
    pub requested: PathBuf,
    /// Resolved path that is actually executed.
    pub canonical: PathBuf,
}

/// Allowlist plus signature verifier. Cheap to clone.
#[derive(Clone)]
pub struct CommandGate {
    allowlist: Arc<CommandAllowlist>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl fmt::Debug for CommandGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGate")
            .field("allowlist", &self.allowlist)
            .field("verifier", &self.verifier.describe())
            .finish()
    }
}

impl CommandGate {
    pub fn new(allowlist: CommandAllowlist, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            allowlist: Arc::new(allowlist),
            verifier,
        }
    }

    pub fn allowlist(&self) -> &CommandAllowlist {
        &self.allowlist
    }

    pub fn verifier_description(&self) -> String {
        self.verifier.describe()
    }

    /// Blocking: the verifier may run an external tool.
    pub fn check(&self, requested: &str) -> Result<VettedCommand, HelperError> {
        let vetted = self.allowlist.vet(requested)?;
        self.verifier
            .verify(&vetted.canonical)
            .map_err(|reason| HelperError::SignatureInvalid {
                path: vetted.canonical.clone(),
                reason,
            })?;
        debug!(
            requested = %vetted.requested.display(),
            canonical = %vetted.canonical.display(),
            "command passed gate"
        );
        Ok(vetted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::signature::MockSignatureVerifier;
    use crate::security::{AcceptAllVerifier, ErrorCode};
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn sh() -> PathBuf {
        std::fs::canonicalize("/bin/sh").unwrap()
    }

    #[test]
    fn allowlisted_binary_passes() {
        let allowlist = CommandAllowlist::new(["/bin/sh"]);
        let vetted = allowlist.vet("/bin/sh").unwrap();
        assert_eq!(vetted.canonical, sh());
        assert_eq!(vetted.requested, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn other_binaries_are_rejected() {
        let allowlist = CommandAllowlist::new(["/bin/sh"]);
        let err = allowlist.vet("/bin/rm").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotAllowlisted);
    }

    #[test]
    fn bare_and_malformed_names_are_rejected() {
        let allowlist = CommandAllowlist::new(["/bin/sh"]);
        for name in ["sh", "", "bin/sh", "/bin/sh\0x", "/no/such/binary"] {
            let err = allowlist.vet(name).unwrap_err();
            assert_eq!(err.code(), ErrorCode::CommandNotAllowlisted, "{name:?}");
        }
    }

    #[test]
    fn symlink_to_allowlisted_binary_resolves_to_it() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("alias");
        symlink(sh(), &link).unwrap();

        let allowlist = CommandAllowlist::new(["/bin/sh"]);
        let vetted = allowlist.vet(link.to_str().unwrap()).unwrap();
        assert_eq!(vetted.canonical, sh());
        assert_eq!(vetted.requested, link);
    }

    #[test]
    fn missing_and_relative_entries_are_dropped() {
        let allowlist = CommandAllowlist::new(["/bin/sh", "/no/such/tool", "relative/tool"]);
        assert_eq!(allowlist.len(), 1);
    }

    #[test]
    fn gate_consults_verifier_with_canonical_path() {
        let mut verifier = MockSignatureVerifier::new();
        let expected = sh();
        verifier
            .expect_verify()
            .withf(move |path| path.to_path_buf() == expected)
            .times(1)
            .returning(|_| Ok(()));

        let gate = CommandGate::new(CommandAllowlist::new(["/bin/sh"]), Arc::new(verifier));
        assert!(gate.check("/bin/sh").is_ok());
    }

    #[test]
    fn gate_maps_verifier_rejection() {
        let mut verifier = MockSignatureVerifier::new();
        verifier
            .expect_verify()
            .returning(|_| Err("not signed by a trusted anchor".into()));

        let gate = CommandGate::new(CommandAllowlist::new(["/bin/sh"]), Arc::new(verifier));
        let err = gate.check("/bin/sh").unwrap_err();
        assert_eq!(err.code(), ErrorCode::SignatureInvalid);
        assert!(err.to_string().contains("trusted anchor"));
    }

    #[test]
    fn gate_skips_verifier_for_rejected_command() {
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().never();

        let gate = CommandGate::new(CommandAllowlist::new(["/bin/sh"]), Arc::new(verifier));
        let err = gate.check("/bin/rm").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotAllowlisted);
    }

    #[test]
    fn debug_shows_verifier_label() {
        let gate = CommandGate::new(CommandAllowlist::default(), Arc::new(AcceptAllVerifier));
        assert!(format!("{gate:?}").contains("accept-all"));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn dscacheutil_passes_production_gate() {
        let gate = CommandGate::new(
            CommandAllowlist::new(["/usr/bin/dscacheutil"]),
            Arc::new(crate::security::CodesignVerifier::default()),
        );
        assert!(gate.check("/usr/bin/dscacheutil").is_ok());
    }
}

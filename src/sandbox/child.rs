//! Child-side setup applied between fork and exec.

use std::io;

use nix::sys::resource::{Resource, getrlimit, setrlimit};

/// Install the pre-exec resource limits on `cmd`.
pub fn install_limits(cmd: &mut tokio::process::Command, max_open_files: u64) {
    // SAFETY: the closure only issues getrlimit/setrlimit, which are
    // async-signal-safe, and allocates nothing.
    unsafe {
        cmd.pre_exec(move || apply_rlimits(max_open_files).map_err(io::Error::from));
    }
}

/// No core dumps from a privileged child; bounded descriptor table.
fn apply_rlimits(max_open_files: u64) -> nix::Result<()> {
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;

    // Never try to raise the hard limit; that needs privileges we may lack.
    let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    let nofile = max_open_files.min(hard);
    setrlimit(Resource::RLIMIT_NOFILE, nofile, nofile)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn limits_reach_the_child() {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("ulimit -c; ulimit -n")
            .stdout(Stdio::piped());
        install_limits(&mut cmd, 64);

        let output = cmd.output().await.unwrap();
        let text = String::from_utf8(output.stdout).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["0", "64"]);
    }

    #[tokio::test]
    async fn arg0_is_visible_to_the_child() {
        let output = tokio::process::Command::new("/bin/sh")
            .arg0("renamed-shell")
            .arg("-c")
            .arg("echo $0")
            .stdout(Stdio::piped())
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8(output.stdout).unwrap(), "renamed-shell\n");
    }
}

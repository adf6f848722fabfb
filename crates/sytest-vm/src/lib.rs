//! Sandboxed native judge, reached through a Docker container.
//!
//! The harness owns a shared directory that is bind-mounted into the
//! container at a fixed guest path. Before each invocation the native
//! artifact (`out.S`) and the stdin fixture (`input.txt`) are staged there;
//! the container runs a fixed judge script and reports the program's
//! behavior on its own stdout.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sytest_proc::{run_command, RunLimits, RunOutput};

pub const GUEST_SHARE_PATH: &str = "/tmp/hostshare";
pub const JUDGE_ENTRY: &str = "/tmp/hostshare/judge.sh";
pub const ARTIFACT_FILE_NAME: &str = "out.S";
pub const STDIN_FILE_NAME: &str = "input.txt";

const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub docker_bin: String,
    /// Invoke the container runtime through `sudo` (rootful daemons).
    pub sudo: bool,
    pub image: String,
    pub share_dir: PathBuf,
    /// Wall limit for one container invocation. Containers are slow to
    /// start, so this is configured independently from interpreter timeouts.
    pub wall: Duration,
    /// Ask the judge to report execution timing.
    pub timeit: bool,
}

impl JudgeConfig {
    pub fn artifact_path(&self) -> PathBuf {
        self.share_dir.join(ARTIFACT_FILE_NAME)
    }

    pub fn stdin_path(&self) -> PathBuf {
        self.share_dir.join(STDIN_FILE_NAME)
    }

    /// Stage the stdin fixture into the share before a run.
    pub fn stage_stdin(&self, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.share_dir)
            .with_context(|| format!("create share dir: {}", self.share_dir.display()))?;
        let path = self.stdin_path();
        std::fs::write(&path, bytes)
            .with_context(|| format!("write stdin fixture: {}", path.display()))?;
        Ok(())
    }

    /// Run the in-container judge against the staged artifact. On timeout
    /// the container is hard-killed and removed before returning.
    pub fn run(&self, run_id: &str) -> Result<RunOutput> {
        let container_id = container_id_for(run_id);
        let share = self
            .share_dir
            .canonicalize()
            .with_context(|| format!("resolve share dir: {}", self.share_dir.display()))?;
        validate_mount_path(&share)?;

        let mut cmd = self.docker_command();
        for arg in judge_args(&container_id, &share, &self.image, self.timeit) {
            cmd.arg(arg);
        }

        let out = run_command(cmd, b"", &RunLimits::new(self.wall), &[])?;
        if out.timed_out {
            let _ = self.hard_kill(&container_id);
            let _ = self.cleanup(&container_id);
        }
        Ok(out)
    }

    fn docker_command(&self) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.docker_bin);
            cmd
        } else {
            Command::new(&self.docker_bin)
        }
    }

    fn hard_kill(&self, container_id: &str) -> Result<()> {
        let mut cmd = self.docker_command();
        cmd.arg("kill")
            .arg("--signal")
            .arg("SIGKILL")
            .arg(container_id);
        let _ = run_command(cmd, b"", &RunLimits::new(KILL_WAIT), &[])
            .with_context(|| format!("{} kill {container_id}", self.docker_bin))?;
        Ok(())
    }

    fn cleanup(&self, container_id: &str) -> Result<()> {
        let mut cmd = self.docker_command();
        cmd.arg("rm").arg("-f").arg(container_id);
        let _ = run_command(cmd, b"", &RunLimits::new(KILL_WAIT), &[])
            .with_context(|| format!("{} rm -f {container_id}", self.docker_bin))?;
        Ok(())
    }
}

/// Container name for one judge invocation. Run ids come from test-case
/// paths, so the name is a digest rather than the id itself: always valid
/// for Docker and killable by name after an escape.
pub fn container_id_for(run_id: &str) -> String {
    let digest = Sha256::digest(run_id.as_bytes());
    let mut short = String::with_capacity(12);
    for b in digest.iter().take(6) {
        short.push_str(&format!("{b:02x}"));
    }
    format!("sytest-judge-{short}")
}

fn judge_args(container_id: &str, share: &Path, image: &str, timeit: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        container_id.into(),
        "--mount".into(),
        format!(
            "type=bind,source={},target={GUEST_SHARE_PATH}",
            share.display()
        )
        .into(),
        image.into(),
        JUDGE_ENTRY.into(),
    ];
    if timeit {
        args.push("--timeit".into());
    }
    args
}

fn validate_mount_path(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt as _;
        for &bad in [b',', b'\0', b'\n', b'\r'].iter() {
            if path.as_os_str().as_bytes().contains(&bad) {
                anyhow::bail!(
                    "share dir path contains disallowed byte {bad:?}: {}",
                    path.display()
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_is_deterministic_and_docker_safe() {
        let a = container_id_for("testcases/func/01_add.sy");
        let b = container_id_for("testcases/func/01_add.sy");
        assert_eq!(a, b);
        assert!(a.starts_with("sytest-judge-"));
        assert!(a.len() <= 64);
        assert!(a
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'));
    }

    #[test]
    fn container_id_distinguishes_run_ids() {
        assert_ne!(
            container_id_for("func/01_add.sy"),
            container_id_for("func/02_sub.sy")
        );
    }

    #[test]
    fn judge_args_mount_and_entry() {
        let args = judge_args("sytest-judge-abc", Path::new("/work/share"), "riscv-dev-env", false);
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered[0], "run");
        assert!(rendered.contains(&"--rm".to_string()));
        assert!(rendered
            .contains(&"type=bind,source=/work/share,target=/tmp/hostshare".to_string()));
        assert_eq!(rendered[rendered.len() - 2], "riscv-dev-env");
        assert_eq!(rendered[rendered.len() - 1], "/tmp/hostshare/judge.sh");
    }

    #[test]
    fn judge_args_timeit_flag_is_last() {
        let args = judge_args("c", Path::new("/s"), "img", true);
        assert_eq!(args.last().unwrap().to_string_lossy(), "--timeit");
    }

    #[test]
    fn mount_path_rejects_kv_breaking_bytes() {
        assert!(validate_mount_path(Path::new("/tmp/ok/share")).is_ok());
        assert!(validate_mount_path(Path::new("/tmp/bad,share")).is_err());
        assert!(validate_mount_path(Path::new("/tmp/bad\nshare")).is_err());
    }

    #[test]
    fn stage_stdin_creates_share_and_fixture() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = JudgeConfig {
            docker_bin: "docker".to_string(),
            sudo: false,
            image: "riscv-dev-env".to_string(),
            share_dir: dir.path().join("share"),
            wall: Duration::from_secs(60),
            timeit: false,
        };
        cfg.stage_stdin(b"1 2\n").unwrap();
        assert_eq!(std::fs::read(cfg.stdin_path()).unwrap(), b"1 2\n");
        assert_eq!(cfg.artifact_path(), dir.path().join("share").join("out.S"));
    }
}

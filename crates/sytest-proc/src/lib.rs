//! Bounded subprocess execution for the test harness.
//!
//! Children are spawned into their own session/process group so a wall-clock
//! timeout can reap the whole descendant tree, with a best-effort
//! kill-by-name sweep for executors known to escape the group.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Sentinel status reported when the wall-clock limit expired. Real exit
/// codes are non-negative, signal deaths map to 128+N.
pub const TIMEOUT_STATUS: i32 = -1;

const DEFAULT_STREAM_CAP: usize = 16 * 1024 * 1024;

/// How long to keep collecting buffered output after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RunLimits {
    pub wall: Duration,
    pub stdout_cap: usize,
    pub stderr_cap: usize,
}

impl RunLimits {
    pub fn new(wall: Duration) -> Self {
        Self {
            wall,
            stdout_cap: DEFAULT_STREAM_CAP,
            stderr_cap: DEFAULT_STREAM_CAP,
        }
    }
}

/// The observable outcome of one bounded invocation. A non-zero status is
/// ordinary data, not a harness fault.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_status: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Outcome of a "must succeed" invocation (`run_checked`).
#[derive(Debug, Clone)]
pub enum Checked {
    /// Exit status 0; carries the decoded stdout.
    Clean(String),
    /// Non-zero or timed-out status; `detail` renders stdout, stderr and the
    /// status into one report-ready string.
    Failed { detail: String, exit_status: i32 },
}

/// Run `cmd` with `stdin_bytes` piped in, under `limits.wall`. Stdout and
/// stderr are drained concurrently with per-stream byte caps. On timeout the
/// child's process group is SIGKILLed, each name in `sweep_names` gets a
/// `pkill -KILL -x` sweep, and remaining output is collected under a bounded
/// grace period.
///
/// Errors only if the command cannot be spawned at all.
pub fn run_command(
    mut cmd: Command,
    stdin_bytes: &[u8],
    limits: &RunLimits,
    sweep_names: &[&str],
) -> Result<RunOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    spawn_in_own_group(&mut cmd);

    let mut child = cmd.spawn().with_context(|| format!("spawn {program}"))?;

    let mut stdin = child.stdin.take().context("take stdin")?;
    let input = stdin_bytes.to_vec();
    std::thread::spawn(move || {
        // EPIPE from a child that exits without reading is fine.
        let _ = stdin.write_all(&input);
    });

    let stdout = child.stdout.take().context("take stdout")?;
    let stderr = child.stderr.take().context("take stderr")?;
    let stdout_cap = limits.stdout_cap;
    let stderr_cap = limits.stderr_cap;

    let (stdout_tx, stdout_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = stdout_tx.send(read_to_end_capped(stdout, stdout_cap));
    });
    let (stderr_tx, stderr_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = stderr_tx.send(read_to_end_capped(stderr, stderr_cap));
    });

    let (status, timed_out) = wait_with_deadline(&mut child, limits.wall, sweep_names)?;

    let (stdout_bytes, stdout_truncated) = recv_drained(stdout_rx, timed_out)?;
    let (stderr_bytes, stderr_truncated) = recv_drained(stderr_rx, timed_out)?;

    let exit_status = if timed_out { TIMEOUT_STATUS } else { status };

    Ok(RunOutput {
        exit_status,
        timed_out,
        stdout: stdout_bytes,
        stderr: stderr_bytes,
        stdout_truncated,
        stderr_truncated,
    })
}

/// `run_command`, then fold a non-zero status into a typed `Checked::Failed`
/// with the combined diagnostic rendering. Spawn failure stays a hard error.
pub fn run_checked(
    cmd: Command,
    stdin_bytes: &[u8],
    limits: &RunLimits,
    sweep_names: &[&str],
) -> Result<Checked> {
    let out = run_command(cmd, stdin_bytes, limits, sweep_names)?;
    if out.exit_status != 0 {
        return Ok(Checked::Failed {
            detail: format!(
                "{}\n===\n{}\n===\n(errno is {})",
                out.stdout_lossy(),
                out.stderr_lossy(),
                out.exit_status
            ),
            exit_status: out.exit_status,
        });
    }
    Ok(Checked::Clean(out.stdout_lossy()))
}

fn wait_with_deadline(child: &mut Child, wall: Duration, sweep_names: &[&str]) -> Result<(i32, bool)> {
    let deadline = Instant::now().checked_add(wall.max(Duration::from_millis(1)));

    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok((exit_code_of(status), false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            hard_kill_pid_and_group(child.id());
            for name in sweep_names {
                kill_by_name_best_effort(name);
            }
            let _ = child.kill();
            let _ = child.wait();
            return Ok((TIMEOUT_STATUS, true));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn recv_drained(
    rx: mpsc::Receiver<std::io::Result<(Vec<u8>, bool)>>,
    timed_out: bool,
) -> Result<(Vec<u8>, bool)> {
    let drained = if timed_out {
        // An escaped writer could hold the pipe open past the group kill;
        // give up on the tail after the grace period.
        rx.recv_timeout(DRAIN_GRACE)
            .unwrap_or(Ok((Vec::new(), false)))
    } else {
        rx.recv().unwrap_or(Ok((Vec::new(), false)))
    };
    drained.context("drain child output")
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| 128 + s).unwrap_or(1),
    }
}

fn spawn_in_own_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

pub fn hard_kill_pid_and_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Secondary fallback for executors that escape their process group.
pub fn kill_by_name_best_effort(name: &str) {
    #[cfg(unix)]
    {
        let _ = Command::new("pkill")
            .arg("-KILL")
            .arg("-x")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = name;
    }
}

pub fn read_to_end_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }

        if truncated {
            continue;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

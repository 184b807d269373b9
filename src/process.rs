//! Supervised child processes.
//!
//! Every process runs in its own process group under a hard wall-clock timeout. On
//! timeout or cancellation the whole group receives SIGTERM, then SIGKILL after a
//! grace period, so grandchildren spawned by a backend do not outlive it. Output is
//! captured incrementally as raw bytes and decoded lossily, so a stray non-UTF-8 byte
//! never stops the pipe from draining; a cancelled process still reports what it
//! printed. Each stream keeps at most `MAX_CAPTURE_BYTES`, dropping the oldest output.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// How long to wait for output pipes to drain after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-stream capture limit. Older output is discarded past this.
pub const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Written to stdin, which is then closed
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl ProcessSpec {
    /// `sh -c <command>`
    pub fn shell(command: &str, cwd: PathBuf, timeout: Duration) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd,
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    /// Killed by a signal it did not receive from us
    Signalled,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ExitKind,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped from the front of stdout and stderr to respect the capture limit
    pub truncated_bytes: usize,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit == ExitKind::Exited(0)
    }

    /// stdout and stderr joined, for diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// A running supervised process.
///
/// `cancel()` terminates the process group; `wait()` then returns promptly with
/// `ExitKind::Cancelled`.
pub struct ProcessHandle {
    cancel: CancellationToken,
    supervisor: JoinHandle<ProcessOutput>,
}

impl ProcessHandle {
    /// Spawn the process. Cancelling `cancel` (or any parent token) stops it.
    pub fn spawn(spec: ProcessSpec, cancel: CancellationToken) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(program = %spec.program, pid = ?pid, "Spawned process");

        if let Some(payload) = spec.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            tokio::spawn(async move {
                // A process that exits without reading its input is not an error.
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let supervisor = tokio::spawn(supervise(child, pid, spec.timeout, cancel.clone()));
        Ok(Self { cancel, supervisor })
    }

    /// Terminate the process group and unblock `wait()`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<ProcessOutput> {
        self.supervisor.await.context("Process supervisor panicked")
    }
}

enum Stop {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    timeout: Duration,
    cancel: CancellationToken,
) -> ProcessOutput {
    let started = Instant::now();
    let stdout_buf = Arc::new(Mutex::new(Captured::default()));
    let stderr_buf = Arc::new(Mutex::new(Captured::default()));
    let readers = [
        child
            .stdout
            .take()
            .map(|out| tokio::spawn(capture(out, stdout_buf.clone()))),
        child
            .stderr
            .take()
            .map(|err| tokio::spawn(capture(err, stderr_buf.clone()))),
    ];

    let stop = tokio::select! {
        biased;
        _ = cancel.cancelled() => Stop::Cancelled,
        status = child.wait() => Stop::Exited(status),
        _ = tokio::time::sleep(timeout) => Stop::TimedOut,
    };

    let exit = match stop {
        Stop::Exited(Ok(status)) => match status.code() {
            Some(code) => ExitKind::Exited(code),
            None => ExitKind::Signalled,
        },
        Stop::Exited(Err(e)) => {
            warn!(error = %e, "Failed to wait for process");
            ExitKind::Signalled
        }
        Stop::TimedOut => {
            warn!(pid = ?pid, timeout_secs = timeout.as_secs(), "Process timed out");
            terminate_group(&mut child, pid).await;
            ExitKind::TimedOut
        }
        Stop::Cancelled => {
            debug!(pid = ?pid, "Process cancelled");
            terminate_group(&mut child, pid).await;
            ExitKind::Cancelled
        }
    };

    for reader in readers.into_iter().flatten() {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            abort.abort();
        }
    }

    let take = |buf: &Arc<Mutex<Captured>>| {
        buf.lock()
            .map(|c| (c.text.clone(), c.dropped))
            .unwrap_or_default()
    };
    let (stdout, dropped_out) = take(&stdout_buf);
    let (stderr, dropped_err) = take(&stderr_buf);
    ProcessOutput {
        exit,
        stdout,
        stderr,
        truncated_bytes: dropped_out + dropped_err,
        elapsed: started.elapsed(),
    }
}

/// The retained tail of one output stream.
#[derive(Debug, Default)]
struct Captured {
    text: String,
    dropped: usize,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        self.text.push_str(&String::from_utf8_lossy(chunk));
        if self.text.len() <= limit {
            return;
        }
        // Trim to three quarters of the limit so trimming stays amortized.
        let mut cut = self.text.len() - limit * 3 / 4;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.dropped += cut;
    }
}

async fn capture<R: AsyncRead + Unpin>(reader: R, buf: Arc<Mutex<Captured>>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Ok(mut b) = buf.lock() {
                    b.push(&line, MAX_CAPTURE_BYTES);
                }
            }
            Err(e) => {
                debug!(error = %e, "Output pipe closed");
                break;
            }
        }
    }
}

/// SIGTERM the group, then SIGKILL it if the leader has not exited after the grace period.
async fn terminate_group(child: &mut Child, pid: Option<u32>) {
    signal_group(child, pid, Signal::Term);
    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        signal_group(child, pid, Signal::Kill);
        let _ = child.wait().await;
    }
    // Stragglers that ignored SIGTERM
    signal_group(child, pid, Signal::Kill);
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid signals the process group we created.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: Signal) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(cmd: &str, dir: &std::path::Path, timeout: Duration) -> ProcessSpec {
        ProcessSpec::shell(cmd, dir.to_path_buf(), timeout)
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let handle = ProcessHandle::spawn(
            spec("echo out; echo err >&2; exit 3", dir.path(), Duration::from_secs(10)),
            CancellationToken::new(),
        )
        .unwrap();
        let out = handle.wait().await.unwrap();
        assert_eq!(out.exit, ExitKind::Exited(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_stdin_payload_and_env() {
        let dir = tempdir().unwrap();
        let mut s = spec("cat; echo \"stage=$STAGE\"", dir.path(), Duration::from_secs(10))
            .env("STAGE", "QA");
        s.stdin = Some("payload\n".to_string());
        let out = ProcessHandle::spawn(s, CancellationToken::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("payload"));
        assert!(out.stdout.contains("stage=QA"));
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_non_zero_exit() {
        let dir = tempdir().unwrap();
        let out = ProcessHandle::spawn(
            spec("sleep 30", dir.path(), Duration::from_millis(200)),
            CancellationToken::new(),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();
        assert_eq!(out.exit, ExitKind::TimedOut);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_wait_and_keeps_partial_output() {
        let dir = tempdir().unwrap();
        let handle = ProcessHandle::spawn(
            spec("echo started; sleep 30", dir.path(), Duration::from_secs(60)),
            CancellationToken::new(),
        )
        .unwrap();
        let token = handle.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });
        let out = handle.wait().await.unwrap();
        assert_eq!(out.exit, ExitKind::Cancelled);
        assert!(out.stdout.contains("started"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_grandchildren() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("grandchild.pid");
        let cmd = format!("sh -c 'echo $$ > {}; sleep 30' & wait", marker.display());
        let handle = ProcessHandle::spawn(
            spec(&cmd, dir.path(), Duration::from_secs(60)),
            CancellationToken::new(),
        )
        .unwrap();
        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.cancel();
        handle.wait().await.unwrap();

        let pid: i32 = std::fs::read_to_string(&marker)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Gone, or a zombie waiting to be reaped
        let alive = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| !stat.contains(") Z "))
            .unwrap_or(false);
        assert!(!alive, "grandchild {} survived group termination", pid);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_draining() {
        let dir = tempdir().unwrap();
        let cmd = "printf 'before\\n\\377\\376 bad bytes\\n'; sleep 0.3; \
                   for i in $(seq 20000); do echo line$i; done; echo done-marker";
        let handle = ProcessHandle::spawn(
            spec(cmd, dir.path(), Duration::from_secs(30)),
            CancellationToken::new(),
        )
        .unwrap();
        let out = handle.wait().await.unwrap();
        assert_eq!(out.exit, ExitKind::Exited(0));
        assert!(out.stdout.starts_with("before\n\u{FFFD}\u{FFFD} bad bytes\n"));
        assert!(out.stdout.contains("line20000\n"));
        assert!(out.stdout.ends_with("done-marker\n"));
        assert_eq!(out.truncated_bytes, 0);
    }

    #[test]
    fn test_capture_keeps_tail_within_limit() {
        let mut captured = Captured::default();
        for i in 0..100 {
            captured.push(format!("line{:03}\n", i).as_bytes(), 80);
        }
        assert!(captured.text.len() <= 80);
        assert!(captured.text.ends_with("line099\n"));
        assert!(!captured.text.contains("line000"));
        assert_eq!(captured.dropped + captured.text.len(), 800);
    }

    #[test]
    fn test_capture_trims_on_char_boundary() {
        let mut captured = Captured::default();
        captured.push("ééééé".as_bytes(), 4);
        assert!(captured.text.len() <= 4);
        assert!(captured.text.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let dir = tempdir().unwrap();
        let s = ProcessSpec {
            program: "/nonexistent/backend".into(),
            args: vec![],
            cwd: dir.path().to_path_buf(),
            env: vec![],
            stdin: None,
            timeout: Duration::from_secs(1),
        };
        assert!(ProcessHandle::spawn(s, CancellationToken::new()).is_err());
    }
}

//! OS process capability used by the supervisor.
//!
//! [`Launcher`] starts a worker and hands back a [`Process`]; the
//! supervisor only ever talks to those two traits, so tests can swap in
//! fakes. [`ChildLauncher`] is the real implementation on top of
//! `tokio::process`.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything needed to start one relay worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Channel name, passed as the single positional argument.
    pub channel: String,
    pub env: Vec<(String, String)>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// A started worker process.
#[async_trait]
pub trait Process: Send {
    /// OS process id, `None` once the process has been reaped.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check: `Some` once the process has exited.
    fn poll(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Ask the process to exit, wait up to `timeout`, then force-kill it.
    async fn terminate(&mut self, timeout: Duration) -> io::Result<ProcessExit>;

    /// Force-kill the process and reap it.
    async fn kill(&mut self) -> io::Result<ProcessExit>;

    /// Most recent output lines, oldest first.
    fn output_tail(&self) -> Vec<String>;
}

/// Starts worker processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(&self, command: &WorkerCommand) -> io::Result<Box<dyn Process>>;
}

/// Bounded ring of recent output lines shared with the reader tasks.
#[derive(Clone)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Launches workers as child processes with piped output.
pub struct ChildLauncher {
    tail_lines: usize,
}

impl ChildLauncher {
    pub const fn new(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

#[async_trait]
impl Launcher for ChildLauncher {
    async fn start(&self, command: &WorkerCommand) -> io::Result<Box<dyn Process>> {
        let mut cmd = Command::new(&command.program);
        cmd.arg(&command.channel)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let tail = OutputTail::new(self.tail_lines);

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, command.channel.clone(), tail.clone(), false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, command.channel.clone(), tail.clone(), true);
        }

        info!(
            channel = %command.channel,
            program = %command.program.display(),
            pid = ?pid,
            "Worker process started"
        );

        Ok(Box::new(ChildProcess { child, pid, tail }))
    }
}

/// Drain a worker pipe into the daemon log and the output tail.
fn forward_output<R>(stream: R, channel: String, tail: OutputTail, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(channel = %channel, "worker stderr: {}", line);
            } else {
                debug!(channel = %channel, "worker: {}", line);
            }
            tail.push(line);
        }
        debug!(channel = %channel, is_stderr, "worker output reader finished");
    });
}

/// A worker running as a `tokio` child process.
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    tail: OutputTail,
}

#[async_trait]
impl Process for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn poll(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(ProcessExit::from))
    }

    async fn terminate(&mut self, timeout: Duration) -> io::Result<ProcessExit> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }

        request_shutdown(&mut self.child)?;

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = ?self.pid, ?status, "Worker exited gracefully");
                Ok(status.into())
            }
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "Error waiting for worker, killing");
                self.kill().await
            }
            Err(_) => {
                warn!(pid = ?self.pid, ?timeout, "Timeout waiting for graceful shutdown, killing");
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> io::Result<ProcessExit> {
        self.child.kill().await?;
        let status = self.child.wait().await?;
        Ok(status.into())
    }

    fn output_tail(&self) -> Vec<String> {
        self.tail.snapshot()
    }
}

/// Send SIGTERM (unix) so the worker can flush its log before exiting.
#[cfg(unix)]
fn request_shutdown(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: pid comes from our own Child handle, which has not been reaped
    // yet (try_wait returned None), so it cannot have been recycled.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

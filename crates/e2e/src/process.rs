//! Child process handle shared by the backend and frontend supervisors
//!
//! Children are spawned as process-group leaders so that everything they
//! fork (npm -> sh -> node, for the dev server) can be signalled together.
//! Output from both pipes is read line by line into one cumulative buffer
//! and mirrored to the test's [`LogSink`].

use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{truncate_output, E2eError, E2eResult};
use crate::log_sink::{LogSink, LogSource};

/// Grace period between SIGTERM and SIGKILL
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Bound on waiting for the exit after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Largest amount of output kept in memory per process
const MAX_BUFFERED_OUTPUT: usize = 1024 * 1024;

/// Output size embedded in error messages
pub const ERROR_OUTPUT_LIMIT: usize = 4000;

/// Cumulative stdout+stderr of a child
#[derive(Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    fn push_line(&self, line: &str) {
        let mut buffer = self.0.lock();
        buffer.push_str(line);
        buffer.push('\n');
        if buffer.len() > MAX_BUFFERED_OUTPUT {
            let mut cut = buffer.len() - MAX_BUFFERED_OUTPUT;
            while !buffer.is_char_boundary(cut) {
                cut += 1;
            }
            buffer.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> String {
        self.0.lock().clone()
    }

    /// Bounded tail for error messages
    pub fn tail(&self) -> String {
        truncate_output(&self.0.lock(), ERROR_OUTPUT_LIMIT)
    }
}

/// What to launch
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Label used in logs and errors
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub source: LogSource,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, source: LogSource) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            source,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// A running child with captured output and two-phase shutdown
pub struct ManagedProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    output: OutputBuffer,
    sink: LogSink,
    stopped: bool,
}

impl ManagedProcess {
    pub fn spawn(spec: ProcessSpec, sink: LogSink) -> E2eResult<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| E2eError::Spawn {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        info!("Spawned {} (pid: {:?})", spec.name, pid);
        sink.test(format!("Spawned {} (pid: {:?})", spec.name, pid));

        let output = OutputBuffer::default();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_lines(stdout, output.clone(), sink.clone(), spec.source));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_lines(stderr, output.clone(), sink.clone(), spec.source));
        }

        Ok(Self {
            name: spec.name,
            child,
            pid,
            output,
            sink,
            stopped: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// Exit status if the child has already exited
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, wait up to [`TERMINATE_GRACE`], then SIGKILL.
    ///
    /// The group is signalled even when the leader has already exited, so
    /// anything it left behind goes down with it. Never fails and is safe to
    /// call repeatedly; problems are logged.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let leader_exited = match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} already exited ({}), sweeping its group", self.name, status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.cleanup_error(format!("try_wait on {} failed: {}", self.name, e));
                false
            }
        };

        info!("Stopping {} (pid: {:?})", self.name, self.pid);
        self.sink.test(format!("Stopping {}", self.name));
        self.terminate(leader_exited).await;
    }

    #[cfg(unix)]
    async fn terminate(&mut self, leader_exited: bool) {
        use nix::sys::signal::Signal;

        self.signal(Signal::SIGTERM, !leader_exited);
        if !leader_exited {
            match timeout(TERMINATE_GRACE, self.child.wait()).await {
                Ok(Ok(status)) => debug!("{} exited after SIGTERM ({})", self.name, status),
                Ok(Err(e)) => self.cleanup_error(format!("wait on {} failed: {}", self.name, e)),
                Err(_) => info!(
                    "{} still running after {:?}, sending SIGKILL",
                    self.name, TERMINATE_GRACE
                ),
            }
        }

        // Children that ignored SIGTERM can outlive the leader
        let leader_alive = matches!(self.child.try_wait(), Ok(None));
        self.signal(Signal::SIGKILL, leader_alive);
        self.reap().await;
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self, _leader_exited: bool) {
        if let Err(e) = self.child.start_kill() {
            self.cleanup_error(format!("kill {} failed: {}", self.name, e));
        }
        self.reap().await;
    }

    async fn reap(&mut self) {
        match timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("{} killed ({})", self.name, status),
            Ok(Err(e)) => self.cleanup_error(format!("wait on {} failed: {}", self.name, e)),
            Err(_) => self.cleanup_error(format!("{} did not exit after SIGKILL", self.name)),
        }
    }

    /// Signal the whole process group, falling back to the single pid.
    ///
    /// An empty group (ESRCH) is not an error. The pid fallback is only taken
    /// while the leader is unreaped, since a reaped pid may belong to someone else.
    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal, pid_fallback: bool) {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return };
        let pid = pid as i32;

        match kill(Pid::from_raw(-pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(group_err) if pid_fallback => {
                debug!("{:?} to group {} failed ({}), signalling pid", signal, pid, group_err);
                match kill(Pid::from_raw(pid), signal) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => self.cleanup_error(format!("{:?} to {} failed: {}", signal, pid, e)),
                }
            }
            Err(e) => self.cleanup_error(format!("{:?} to group {} failed: {}", signal, pid, e)),
        }
    }

    fn cleanup_error(&self, message: String) {
        let err = E2eError::Cleanup(message);
        warn!("{}", err);
        self.sink.test(err.to_string());
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        // kill_on_drop only reaches the leader; take the group down too
        kill_group_now(self.pid);
    }
}

#[cfg(unix)]
fn kill_group_now(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group_now(_pid: Option<u32>) {}

async fn capture_lines<R>(reader: R, buffer: OutputBuffer, sink: LogSink, source: LogSource)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\r', '\n']);
                sink.log(source, line);
                buffer.push_line(line);
            }
        }
    }
}

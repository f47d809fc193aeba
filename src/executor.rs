//! Subprocess execution
//!
//! Runs an argv directly (never through a shell), with an optional
//! timeout and extra environment variables layered over the inherited
//! environment.

use crate::error::ExecError;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code reported when the child was killed for exceeding its timeout
/// or terminated by a signal
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// How long to wait for pipes to close after a timed-out group is killed
const PIPE_GRACE: Duration = Duration::from_millis(200);

/// Outcome of one subprocess run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Copy of the argv that was run
    pub command: Vec<String>,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs commands as child processes
#[derive(Debug, Clone)]
pub struct SubprocessExecutor {
    poll_interval: Duration,
    working_dir: Option<PathBuf>,
}

impl Default for SubprocessExecutor {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            working_dir: None,
        }
    }
}

impl SubprocessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run children in `dir` instead of the current directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run `argv` and wait for it, killing it once `timeout` elapses
    pub fn execute(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<ExecutionResult, ExecError> {
        let command = argv.to_vec();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecError::InvalidCommand("empty argument vector".to_string()))?;
        if program.is_empty() {
            return Err(ExecError::InvalidCommand("empty program name".to_string()));
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = env {
            cmd.envs(env);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so a timeout reaches everything the tool spawned.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!(program = %program, args = args.len(), ?timeout, "spawning subprocess");
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::CommandNotFound {
                    program: program.clone(),
                }
            } else {
                ExecError::ExecutionFailed {
                    program: program.clone(),
                    source: e,
                }
            }
        })?;

        let stdout_rx = drain(child.stdout.take());
        let stderr_rx = drain(child.stderr.take());

        let status = match self.wait(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                return Ok(timed_out(program, command, start, timeout, &stdout_rx, &stderr_rx));
            }
            Err(e) => {
                kill_process_group(&mut child);
                let _ = child.wait();
                return Err(ExecError::ExecutionFailed {
                    program: program.clone(),
                    source: e,
                });
            }
        };

        // Background processes can hold the pipes open after the child exits;
        // the deadline still bounds how long we wait for them.
        let (stdout, stderr) = match (collect(&stdout_rx, deadline), collect(&stderr_rx, deadline)) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                kill_process_group(&mut child);
                return Ok(timed_out(program, command, start, timeout, &stdout_rx, &stderr_rx));
            }
        };
        let duration = start.elapsed();
        let exit_code = status.code().unwrap_or(TIMEOUT_EXIT_CODE);
        debug!(program = %program, exit_code, ?duration, "subprocess finished");

        Ok(ExecutionResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration,
            command,
            timed_out: false,
        })
    }

    /// Poll the child until it exits; `Ok(None)` means its group was killed at the deadline
    fn wait(
        &self,
        child: &mut Child,
        deadline: Option<Instant>,
    ) -> std::io::Result<Option<ExitStatus>> {
        let Some(deadline) = deadline else {
            return child.wait().map(Some);
        };
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                kill_process_group(child);
                let _ = child.wait();
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

/// Wait for a drained pipe, giving up at `deadline`
fn collect(rx: &Receiver<Vec<u8>>, deadline: Option<Instant>) -> Option<Vec<u8>> {
    match deadline {
        None => Some(rx.recv().unwrap_or_default()),
        Some(deadline) => match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(buf) => Some(buf),
            Err(RecvTimeoutError::Disconnected) => Some(Vec::new()),
            Err(RecvTimeoutError::Timeout) => None,
        },
    }
}

/// Result for a run that hit its deadline; partial output is dropped
fn timed_out(
    program: &str,
    command: Vec<String>,
    start: Instant,
    timeout: Option<Duration>,
    stdout_rx: &Receiver<Vec<u8>>,
    stderr_rx: &Receiver<Vec<u8>>,
) -> ExecutionResult {
    let duration = start.elapsed();
    warn!(program = %program, ?duration, "subprocess timed out, killed");
    // Let the drain threads see EOF; whatever they read is not trusted.
    let _ = stdout_rx.recv_timeout(PIPE_GRACE);
    let _ = stderr_rx.recv_timeout(PIPE_GRACE);
    ExecutionResult {
        exit_code: TIMEOUT_EXIT_CODE,
        stdout: String::new(),
        stderr: format!(
            "Process timed out after {:.1}s and was killed",
            timeout.unwrap_or_default().as_secs_f64()
        ),
        duration,
        command,
        timed_out: true,
    }
}

/// SIGKILL the child's whole process group
#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // Negative pid addresses the group the child leads.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

/// Read a pipe to the end on its own thread so the child never blocks on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

//! Spawning agent processes with streaming output, timeouts and interrupts.
//!
//! [`run`] never fails: every outcome, including a missing executable, is
//! reported through the [`ExecutionResult`] delivered by the returned
//! [`ExecutionHandle`]. Each invocation uses its own threads:
//!
//! - a stdin writer (only when stdin text is supplied),
//! - one reader per output stream, decoding chunks into a bounded channel,
//! - a dispatcher that invokes the caller's callbacks and accumulates output,
//! - a supervisor that waits for exit and enforces timeout and interrupt.
//!
//! Termination escalates: a graceful signal to the child's process group, a
//! grace window, then a forceful kill.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported when the executable could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;
/// Time between the graceful signal and the forceful kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10_000_000;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const READ_CHUNK_BYTES: usize = 8192;
const CHANNEL_CAPACITY: usize = 64;
/// How long to keep draining output after the child has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback receiving decoded output chunks (not necessarily line-aligned).
pub type OutputCallback = Box<dyn FnMut(&str) + Send + 'static>;

/// Parameters for one process invocation.
pub struct RunOptions {
    pub cwd: PathBuf,
    /// Written to the child's stdin, which is then closed. `None` means stdin is null.
    pub stdin_text: Option<String>,
    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// `None` or zero disables the timeout.
    pub timeout: Option<Duration>,
    pub grace_period: Duration,
    /// Bound on accumulated stdout/stderr kept in the result (per stream).
    pub output_limit_bytes: usize,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
}

impl RunOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            stdin_text: None,
            env: BTreeMap::new(),
            timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            on_stdout: None,
            on_stderr: None,
        }
    }

    pub fn stdin_text(mut self, text: impl Into<String>) -> Self {
        self.stdin_text = Some(text.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn output_limit_bytes(mut self, limit: usize) -> Self {
        self.output_limit_bytes = limit;
        self
    }

    pub fn on_stdout(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stdout = Some(Box::new(callback));
        self
    }

    pub fn on_stderr(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stderr = Some(Box::new(callback));
        self
    }

    fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("cwd", &self.cwd)
            .field("stdin_bytes", &self.stdin_text.as_ref().map(String::len))
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("grace_period", &self.grace_period)
            .field("output_limit_bytes", &self.output_limit_bytes)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Coarse classification of how an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Exited with code 0.
    Completed,
    /// Exited nonzero or was killed by a signal it did not ask for.
    Failed,
    TimedOut,
    Interrupted,
    SpawnFailed,
}

/// Completion signal of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub interrupted: bool,
    pub spawn_error: Option<String>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn status(&self) -> ExecutionStatus {
        if self.spawn_error.is_some() {
            ExecutionStatus::SpawnFailed
        } else if self.interrupted {
            ExecutionStatus::Interrupted
        } else if self.timed_out {
            ExecutionStatus::TimedOut
        } else if self.exit_code == Some(0) {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }

    pub fn success(&self) -> bool {
        self.status() == ExecutionStatus::Completed
    }

    fn spawn_failed(message: String, duration: Duration) -> Self {
        Self {
            exit_code: Some(SPAWN_FAILURE_EXIT_CODE),
            stdout: String::new(),
            stderr: message.clone(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
            interrupted: false,
            spawn_error: Some(message),
            duration,
        }
    }

    fn supervisor_lost() -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: "process supervisor exited without reporting a result".to_string(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
            interrupted: false,
            spawn_error: None,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct InterruptState {
    requested: AtomicBool,
    finished: AtomicBool,
}

/// Cloneable trigger that requests termination of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    /// Request graceful-then-forceful termination.
    ///
    /// Returns `true` only for the first request made while the process is
    /// still running; repeated calls and calls after exit do nothing.
    pub fn interrupt(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        !self.state.requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    fn mark_finished(&self) {
        self.state.finished.store(true, Ordering::SeqCst);
    }
}

/// Live, cancelable representation of one spawned invocation.
///
/// Dropping an unfinished handle interrupts the process.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: String,
    interrupter: Interrupter,
    completion: Receiver<ExecutionResult>,
    result: Option<ExecutionResult>,
}

impl ExecutionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// See [`Interrupter::interrupt`].
    pub fn interrupt(&self) -> bool {
        self.interrupter.interrupt()
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some() || self.interrupter.is_finished()
    }

    /// Non-blocking poll for the completion signal.
    pub fn try_result(&mut self) -> Option<&ExecutionResult> {
        if self.result.is_none() {
            match self.completion.try_recv() {
                Ok(result) => self.result = Some(result),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.result = Some(ExecutionResult::supervisor_lost());
                }
            }
        }
        self.result.as_ref()
    }

    /// Wait up to `timeout` for completion.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<&ExecutionResult> {
        if self.result.is_none() {
            match self.completion.recv_timeout(timeout) {
                Ok(result) => self.result = Some(result),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.result = Some(ExecutionResult::supervisor_lost());
                }
            }
        }
        self.result.as_ref()
    }

    /// Block until the process has finished and all output was delivered.
    pub fn wait(mut self) -> ExecutionResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        self.completion
            .recv()
            .unwrap_or_else(|_| ExecutionResult::supervisor_lost())
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if self.interrupter.interrupt() {
            debug!(execution_id = %self.id, "execution handle dropped while running; interrupting");
        }
    }
}

/// Spawn `executable` with `args` and return a handle to the running invocation.
#[instrument(skip_all, fields(executable = %executable, timeout_ms = options.effective_timeout().map(|t| t.as_millis() as u64)))]
pub fn run(executable: &str, args: &[String], mut options: RunOptions) -> ExecutionHandle {
    let id = uuid::Uuid::new_v4().to_string();
    let interrupter = Interrupter::default();
    let (completion_tx, completion_rx) = mpsc::channel();
    let started = Instant::now();

    let mut cmd = Command::new(executable);
    cmd.args(args)
        .current_dir(&options.cwd)
        .envs(&options.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if options.stdin_text.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    isolate_process_group(&mut cmd);

    debug!(execution_id = %id, cwd = %options.cwd.display(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            let message = format!("failed to spawn {executable}: {err}");
            if let Some(on_stderr) = options.on_stderr.as_mut() {
                on_stderr(&message);
            }
            interrupter.mark_finished();
            // The receiver is still held below, so this cannot fail.
            let _ = completion_tx.send(ExecutionResult::spawn_failed(message, started.elapsed()));
            return ExecutionHandle {
                id,
                interrupter,
                completion: completion_rx,
                result: None,
            };
        }
    };

    if let (Some(text), Some(mut stdin)) = (options.stdin_text.take(), child.stdin.take()) {
        thread::spawn(move || {
            if let Err(err) = stdin.write_all(text.as_bytes()) {
                // The child may exit before reading its input.
                debug!(err = %err, "write stdin");
            }
        });
    }

    let (chunk_tx, chunk_rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        let tx = chunk_tx.clone();
        thread::spawn(move || pump(stdout, Stream::Stdout, tx));
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = chunk_tx.clone();
        thread::spawn(move || pump(stderr, Stream::Stderr, tx));
    }
    drop(chunk_tx);

    let capture = Arc::new(Mutex::new(Capture::new(options.output_limit_bytes)));
    let (drained_tx, drained_rx) = mpsc::channel::<()>();
    {
        let capture = Arc::clone(&capture);
        let on_stdout = options.on_stdout.take();
        let on_stderr = options.on_stderr.take();
        thread::spawn(move || {
            dispatch(chunk_rx, on_stdout, on_stderr, &capture);
            drop(drained_tx);
        });
    }

    let supervision = Supervision {
        execution_id: id.clone(),
        interrupter: interrupter.clone(),
        deadline: options.effective_timeout().map(|timeout| started + timeout),
        grace_period: options.grace_period,
        started,
    };
    thread::spawn(move || {
        let outcome = supervision.watch(&mut child);
        // Waiting for the dispatcher here guarantees every callback has run
        // before the completion signal is observable.
        let _ = drained_rx.recv_timeout(OUTPUT_DRAIN_TIMEOUT);
        let captured = std::mem::take(&mut *capture.lock().unwrap_or_else(PoisonError::into_inner));
        if captured.stdout_truncated > 0 || captured.stderr_truncated > 0 {
            warn!(
                stdout_truncated = captured.stdout_truncated,
                stderr_truncated = captured.stderr_truncated,
                "output truncated"
            );
        }
        let result = ExecutionResult {
            exit_code: outcome.status.and_then(|status| status.code()),
            stdout: captured.stdout,
            stderr: captured.stderr,
            stdout_truncated: captured.stdout_truncated,
            stderr_truncated: captured.stderr_truncated,
            timed_out: outcome.timed_out,
            interrupted: outcome.interrupted,
            spawn_error: None,
            duration: supervision.started.elapsed(),
        };
        debug!(
            execution_id = %supervision.execution_id,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            interrupted = result.interrupted,
            "command finished"
        );
        supervision.interrupter.mark_finished();
        let _ = completion_tx.send(result);
    });

    ExecutionHandle {
        id,
        interrupter,
        completion: completion_rx,
        result: None,
    }
}

struct Supervision {
    execution_id: String,
    interrupter: Interrupter,
    deadline: Option<Instant>,
    grace_period: Duration,
    started: Instant,
}

struct ExitOutcome {
    status: Option<ExitStatus>,
    timed_out: bool,
    interrupted: bool,
}

impl Supervision {
    fn watch(&self, child: &mut Child) -> ExitOutcome {
        loop {
            match child.wait_timeout(POLL_INTERVAL) {
                Ok(Some(status)) => {
                    return ExitOutcome {
                        status: Some(status),
                        timed_out: false,
                        interrupted: false,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(err = %err, "wait for command failed; killing");
                    return ExitOutcome {
                        status: self.terminate(child),
                        timed_out: false,
                        interrupted: false,
                    };
                }
            }

            if self.interrupter.is_requested() {
                debug!(execution_id = %self.execution_id, "interrupt requested");
                return ExitOutcome {
                    status: self.terminate(child),
                    timed_out: false,
                    interrupted: true,
                };
            }
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    execution_id = %self.execution_id,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "command timed out, terminating"
                );
                return ExitOutcome {
                    status: self.terminate(child),
                    timed_out: true,
                    interrupted: false,
                };
            }
        }
    }

    /// Graceful signal, grace window, then forceful kill.
    ///
    /// The kill goes to the whole process group even when the direct child
    /// exited during the grace window, so descendants that ignored the
    /// graceful signal cannot outlive the handle.
    fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        let deadline = Instant::now() + self.grace_period;
        signal_graceful(child);
        let exited = match child.wait_timeout(self.grace_period) {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                warn!(
                    grace_ms = self.grace_period.as_millis() as u64,
                    "command ignored termination signal, killing"
                );
                None
            }
            Err(err) => {
                warn!(err = %err, "wait after termination signal");
                None
            }
        };

        if let Some(status) = exited {
            while group_alive(child) && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
            if group_alive(child) {
                warn!("descendants ignored termination signal, killing process group");
            }
            signal_group_kill(child);
            return Some(status);
        }

        signal_kill(child);
        match child.wait() {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(err = %err, "wait command after kill");
                None
            }
        }
    }
}

/// Put the child in its own process group so signals reach its descendants.
#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_graceful(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(not(unix))]
fn signal_graceful(child: &mut Child) {
    signal_kill(child);
}

#[cfg(unix)]
fn signal_kill(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill command");
    }
}

#[cfg(not(unix))]
fn signal_kill(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill command");
    }
}

#[cfg(unix)]
fn signal_group_kill(child: &Child) {
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn signal_group_kill(_child: &Child) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    let Some(pgid) = group_id(child) else {
        return;
    };
    if let Err(err) = nix::sys::signal::killpg(pgid, signal) {
        // ESRCH once the group has already exited.
        debug!(err = %err, ?signal, "signal process group");
    }
}

/// Whether any member of the child's process group is still running.
#[cfg(unix)]
fn group_alive(child: &Child) -> bool {
    use nix::sys::signal::{Signal, killpg};

    group_id(child).is_some_and(|pgid| killpg(pgid, None::<Signal>).is_ok())
}

#[cfg(not(unix))]
fn group_alive(_child: &Child) -> bool {
    false
}

/// The child leads its own group, so its pid is the group id.
#[cfg(unix)]
fn group_id(child: &Child) -> Option<nix::unistd::Pid> {
    i32::try_from(child.id()).ok().map(nix::unistd::Pid::from_raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct Chunk {
    stream: Stream,
    text: String,
}

fn pump<R: Read>(mut reader: R, stream: Stream, tx: SyncSender<Chunk>) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(err = %err, ?stream, "read output");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        let text = take_decoded(&mut pending);
        if !text.is_empty() && tx.send(Chunk { stream, text }).is_err() {
            return;
        }
    }
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(Chunk { stream, text });
    }
}

/// Decode `pending`, keeping a trailing incomplete UTF-8 sequence for the next read.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    let keep = pending.len() - incomplete_tail_len(pending);
    let rest = pending.split_off(keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

fn dispatch(
    rx: Receiver<Chunk>,
    mut on_stdout: Option<OutputCallback>,
    mut on_stderr: Option<OutputCallback>,
    capture: &Mutex<Capture>,
) {
    for chunk in rx {
        let callback = match chunk.stream {
            Stream::Stdout => on_stdout.as_mut(),
            Stream::Stderr => on_stderr.as_mut(),
        };
        if let Some(callback) = callback {
            callback(&chunk.text);
        }
        capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk.stream, &chunk.text);
    }
}

#[derive(Debug, Default)]
struct Capture {
    limit: usize,
    stdout: String,
    stderr: String,
    stdout_truncated: usize,
    stderr_truncated: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn push(&mut self, stream: Stream, text: &str) {
        let (buf, truncated) = match stream {
            Stream::Stdout => (&mut self.stdout, &mut self.stdout_truncated),
            Stream::Stderr => (&mut self.stderr, &mut self.stderr_truncated),
        };
        let remaining = self.limit.saturating_sub(buf.len());
        if text.len() <= remaining {
            buf.push_str(text);
            return;
        }
        let mut cut = remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        buf.push_str(&text[..cut]);
        *truncated += text.len() - cut;
    }
}

//! Output stream multiplexer.
//!
//! Runs a shell command with both pipes captured and drains them from two
//! reader tasks so the child can never block on a full pipe. Every chunk is
//! appended to its channel's buffer before it is rendered; the terminal view
//! is cosmetic and cannot lose captured text.

use crate::error::{OrchestrationError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one run of the training process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Failed outcome standing in for a run that never produced one.
    #[must_use]
    pub fn synthetic_failure(message: impl Into<String>) -> Self {
        Self { exit_code: 1, stdout: String::new(), stderr: message.into() }
    }
}

/// Something that can run a command line to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`; resolves to `Err(Cancelled)` if `cancel` fires first.
    async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<RunOutcome>;
}

type SinkFactory = Arc<dyn Fn() -> Box<dyn Write + Send> + Send + Sync>;

/// Terminal view of the training output.
///
/// `epoch x/y` lines are remembered, tqdm `steps:` lines overwrite the
/// current terminal line, everything else scrolls.
pub struct LineRenderer {
    out: Box<dyn Write + Send>,
    last_epoch: Option<String>,
    /// A progress bar is on the current terminal line.
    in_place: bool,
}

impl std::fmt::Debug for LineRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineRenderer").field("last_epoch", &self.last_epoch).finish_non_exhaustive()
    }
}

impl LineRenderer {
    #[must_use]
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out, last_epoch: None, in_place: false }
    }

    pub fn render(&mut self, chunk: &str) -> std::io::Result<()> {
        let line = chunk.trim();

        if is_epoch_line(line) {
            self.last_epoch = Some(line.to_string());
            return Ok(());
        }

        if is_progress_line(line) {
            match &self.last_epoch {
                Some(epoch) => write!(self.out, "\r{epoch} | {line}\x1b[K")?,
                None => write!(self.out, "\r{line}\x1b[K")?,
            }
            self.in_place = true;
        } else {
            write!(self.out, "\r{}\x1b[K\n", chunk.trim_end())?;
            self.in_place = false;
        }
        self.out.flush()
    }

    /// Move off a progress bar left on the current line.
    pub fn finish(&mut self) -> std::io::Result<()> {
        if self.in_place {
            self.in_place = false;
            writeln!(self.out)?;
            self.out.flush()?;
        }
        Ok(())
    }
}

fn is_epoch_line(line: &str) -> bool {
    line.starts_with("epoch") && line.contains('/')
}

fn is_progress_line(line: &str) -> bool {
    line.starts_with("steps:") && (line.contains("it/s") || line.contains("s/it"))
}

/// Per-run state shared by the two reader tasks.
struct CaptureContext {
    render: Arc<Mutex<LineRenderer>>,
}

impl CaptureContext {
    fn new(out: Box<dyn Write + Send>) -> Self {
        Self { render: Arc::new(Mutex::new(LineRenderer::new(out))) }
    }

    fn spawn_reader<R>(&self, pipe: R, channel: &'static str) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let render = Arc::clone(&self.render);
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut captured = String::new();
            let mut chunk = Vec::new();
            let mut render_failed = false;

            loop {
                chunk.clear();
                match reader.read_until(b'\n', &mut chunk).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(channel, "error reading process output: {}", e);
                        break;
                    }
                }

                let text = String::from_utf8_lossy(&chunk);
                captured.push_str(&text);

                let mut renderer = render.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = renderer.render(&text) {
                    if !render_failed {
                        debug!(channel, "terminal rendering failed: {}", e);
                        render_failed = true;
                    }
                }
            }

            captured
        })
    }
}

/// [`CommandRunner`] that runs commands through `sh -c` and renders their
/// output live.
#[derive(Clone)]
pub struct StreamMultiplexer {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    grace_period: Duration,
    sink: SinkFactory,
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMultiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            working_dir: None,
            env: Vec::new(),
            grace_period: Duration::from_secs(5),
            sink: Arc::new(|| Box::new(std::io::stdout()) as Box<dyn Write + Send>),
        }
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Time a terminated process gets to exit before it is killed.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Where rendered output goes; stdout by default.
    #[must_use]
    pub fn with_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn() -> Box<dyn Write + Send> + Send + Sync + 'static,
    {
        self.sink = Arc::new(sink);
        self
    }

    /// Run `command` to completion, capturing both channels.
    pub async fn run_and_capture(&self, command: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        info!(command = %command, "running command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|source| OrchestrationError::Spawn { command: command.to_string(), source })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestrationError::Other("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OrchestrationError::Other("stderr was not captured".to_string()))?;

        // Taken now: `Child::id` is gone once the leader has been reaped.
        let pid = child.id();

        let context = CaptureContext::new((self.sink)());
        let stdout_task = context.spawn_reader(stdout, "stdout");
        let stderr_task = context.spawn_reader(stderr, "stderr");
        let readers = async move {
            let stdout = join_reader(stdout_task, "stdout").await;
            let stderr = join_reader(stderr_task, "stderr").await;
            (stdout, stderr)
        };
        tokio::pin!(readers);

        // The pipes stay open while any process in the group holds them, so
        // the leader exiting is not the end of the run.
        let finished = tokio::select! {
            result = async {
                let status = child.wait().await;
                let output = readers.as_mut().await;
                (status, output)
            } => Some(result),
            () = cancel.cancelled() => None,
        };

        let Some((status, (stdout, stderr))) = finished else {
            self.terminate(pid, &mut child, readers.as_mut()).await;
            return Err(OrchestrationError::Cancelled);
        };
        let status = status?;

        let _ = context.render.lock().unwrap_or_else(PoisonError::into_inner).finish();

        Ok(RunOutcome { exit_code: status.code().unwrap_or(-1), stdout, stderr })
    }

    /// Ask the whole process group to stop, then kill it after the grace
    /// period. Returns once the readers are done or a second grace period
    /// has passed.
    async fn terminate<F>(&self, pid: Option<u32>, child: &mut Child, mut readers: Pin<&mut F>)
    where
        F: Future,
    {
        warn!(pid = ?pid, "interrupt received, terminating training process");
        if let Some(pid) = pid {
            signal_group(pid, StopSignal::Terminate);
        }

        let stopped = tokio::time::timeout(self.grace_period, async {
            let _ = child.wait().await;
            let _ = readers.as_mut().await;
        })
        .await;
        if stopped.is_ok() {
            return;
        }

        warn!(pid = ?pid, grace_secs = self.grace_period.as_secs(), "process group did not exit in time, killing it");
        if let Some(pid) = pid {
            signal_group(pid, StopSignal::Kill);
        }
        if let Err(e) = child.start_kill() {
            debug!(pid = ?pid, "leader already gone: {}", e);
        }
        if tokio::time::timeout(self.grace_period, readers).await.is_err() {
            warn!("output readers did not finish after cancellation");
        }
        let _ = child.try_wait();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid`. The group outlives its leader, so
/// workers left behind by the launcher are reached too.
#[cfg(unix)]
fn signal_group(pid: u32, signal: StopSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, cannot signal process group");
        return;
    };
    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), sig) {
        // Nobody left in the group.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = ?sig, "failed to signal process group: {}", e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: StopSignal) {}

async fn join_reader(task: JoinHandle<String>, channel: &'static str) -> String {
    match task.await {
        Ok(text) => text,
        Err(e) => {
            warn!(channel, "output reader task failed: {}", e);
            String::new()
        }
    }
}

#[async_trait]
impl CommandRunner for StreamMultiplexer {
    async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        self.run_and_capture(command, cancel).await
    }
}

#![forbid(unsafe_code)]

//! Lifecycle of the external extraction processes.
//!
//! Every retrieval gets its own child process, started from an argument
//! vector (`<binary> <plan args...> <source url>`) without any shell in
//! between. The child runs in its own process group so that helpers it forks
//! (ffmpeg for re-encoding plans) are signalled together with it.
//!
//! Concurrency is bounded by a semaphore: each [`ExtractionProcess`] holds one
//! permit for as long as it exists, so the limit counts processes that have
//! not been reaped yet rather than requests that are merely in flight.

use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
};

use crate::{error::GatewayError, format::FormatPlan};

pub const DEFAULT_EXTRACTOR_BIN: &str = "yt-dlp";
pub const DEFAULT_MAX_EXTRACTIONS: usize = 4;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    ExitedOk,
    /// Non-zero exit. `None` when the child died from a signal we did not send.
    ExitedError(Option<i32>),
    Killed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Self::ExitedOk
        } else {
            Self::ExitedError(status.code())
        }
    }
}

/// Spawns extraction processes and enforces the concurrency cap.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ProcessManagerInner>,
}

struct ProcessManagerInner {
    binary: PathBuf,
    limiter: Arc<Semaphore>,
    capacity: usize,
    kill_grace: Duration,
    spawned: AtomicU64,
}

impl ProcessManager {
    pub fn new(binary: impl Into<PathBuf>, max_extractions: usize, kill_grace: Duration) -> Self {
        Self {
            inner: Arc::new(ProcessManagerInner {
                binary: binary.into(),
                limiter: Arc::new(Semaphore::new(max_extractions)),
                capacity: max_extractions,
                kill_grace,
                spawned: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Processes that are started and not yet released.
    pub fn active(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.limiter.available_permits())
    }

    pub fn spawned_total(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    /// Builds the command for one retrieval. The source URL is always the
    /// final, standalone argument.
    pub fn command(&self, source_url: &str, plan: &FormatPlan) -> Command {
        let mut command = Command::new(&self.inner.binary);
        command
            .args(&plan.extraction_args)
            .arg(source_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        command
    }

    pub fn start(
        &self,
        source_url: &str,
        plan: &FormatPlan,
    ) -> Result<ExtractionProcess, GatewayError> {
        let permit = match self.inner.limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                return Err(GatewayError::ResourceExhausted {
                    limit: self.inner.capacity,
                });
            }
        };

        let mut child =
            self.command(source_url, plan)
                .spawn()
                .map_err(|source| GatewayError::Spawn {
                    binary: self.inner.binary.display().to_string(),
                    source,
                })?;

        let id = self.inner.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tracing::debug!(
            extraction = id,
            pid = ?pid,
            format = %plan.token,
            "spawned {}",
            self.inner.binary.display()
        );

        Ok(ExtractionProcess {
            id,
            child: Some(child),
            pid,
            stdout,
            stderr,
            state: ProcessState::Running,
            kill_grace: self.inner.kill_grace,
            permit: Some(permit),
        })
    }
}

/// One live extractor child. Dropping it while the child still runs kills the
/// whole process group; the concurrency permit stays taken until the child is
/// reaped.
pub struct ExtractionProcess {
    id: u64,
    /// Only `None` once `Drop` has handed the child to a reap task.
    child: Option<Child>,
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    state: ProcessState,
    kill_grace: Duration,
    permit: Option<OwnedSemaphorePermit>,
}

impl ExtractionProcess {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Waits for the child to exit on its own and reaps it.
    pub async fn wait(&mut self) -> io::Result<ProcessState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(self.state);
        };
        let status = child.wait().await?;
        self.state = ProcessState::from_status(status);
        Ok(self.state)
    }

    /// Like [`Self::wait`], giving up after `timeout`. `Ok(None)` means the
    /// child is still running.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ProcessState>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Stops the child: SIGTERM to the process group, SIGKILL once the grace
    /// period runs out, then reap. Calling it again, or after the child
    /// exited on its own, only reports the recorded state.
    pub async fn terminate(&mut self) -> io::Result<ProcessState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(self.state);
        };
        if let Some(status) = child.try_wait()? {
            self.state = ProcessState::from_status(status);
            return Ok(self.state);
        }

        // Close our ends so a child blocked on a full pipe fails its write.
        self.stdout.take();
        self.stderr.take();

        signal_group(self.id, self.pid, Signal::SIGTERM);
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                tracing::debug!(
                    extraction = self.id,
                    "no exit {:?} after SIGTERM, sending SIGKILL",
                    self.kill_grace
                );
                signal_group(self.id, self.pid, Signal::SIGKILL);
                child.kill().await?;
            }
        }
        self.state = ProcessState::Killed;
        Ok(self.state)
    }
}

fn signal_group(id: u64, pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        tracing::debug!(extraction = id, "{signal} to group {pid} failed: {err}");
    }
}

impl Drop for ExtractionProcess {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        if !matches!(child.try_wait(), Ok(None)) {
            return;
        }
        tracing::debug!(
            extraction = self.id,
            "dropping live extractor, killing its process group"
        );
        signal_group(self.id, self.pid, Signal::SIGKILL);

        // The permit follows the child into the reap task so `active()` keeps
        // counting it until the pid is actually gone.
        let permit = self.permit.take();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = child.wait().await {
                    tracing::debug!("reaping dropped extractor failed: {err}");
                }
                drop(permit);
            });
        }
    }
}

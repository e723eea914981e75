use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::log_hub::LogHub;
use super::types::{RunningCore, StopReason, StopSignal};
use super::utils::{get_version, is_started_banner};
use crate::connection_tracking::ConnectionMetaCache;
use crate::error_handling::types::SupervisorError;

/// How long `start` waits for the readiness banner.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(4);

/// How long `stop` waits after SIGTERM before sending SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Supervises one core child process.
///
/// Design notes:
/// - The configuration document is written to the child's stdin, which is
///   then closed; the child runs `run -config stdin:`.
/// - A single pump task owns the `Child`. It reads stdout and stderr line by
///   line, publishes every line to the [`LogHub`] and feeds it to the
///   [`ConnectionMetaCache`]. Once both streams end it reaps the child,
///   closes log subscribers and publishes a [`StopSignal`].
/// - Each instance has its own hub and cache.
pub struct CoreProcess {
    executable: PathBuf,
    assets_path: PathBuf,
    log_hub: Arc<LogHub>,
    meta_cache: Arc<ConnectionMetaCache>,
    state: Mutex<Option<RunningCore>>,
    stop_tx: watch::Sender<StopSignal>,
    generation: AtomicU64,
    last_version: StdMutex<Option<String>>,
    startup_timeout: Duration,
    stop_timeout: Duration,
}

impl CoreProcess {
    pub fn new(
        executable: impl Into<PathBuf>,
        assets_path: impl Into<PathBuf>,
        meta_cache: ConnectionMetaCache,
    ) -> Self {
        let (stop_tx, _) = watch::channel(StopSignal::initial());
        Self {
            executable: executable.into(),
            assets_path: assets_path.into(),
            log_hub: Arc::new(LogHub::new()),
            meta_cache: Arc::new(meta_cache),
            state: Mutex::new(None),
            stop_tx,
            generation: AtomicU64::new(0),
            last_version: StdMutex::new(None),
            startup_timeout: STARTUP_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    /// Overrides the readiness and graceful-stop waits.
    pub fn with_timeouts(mut self, startup: Duration, stop: Duration) -> Self {
        self.startup_timeout = startup;
        self.stop_timeout = stop;
        self
    }

    /// Spawns the core with `config` on its stdin and waits for readiness.
    ///
    /// Readiness is the startup banner or the end of the output streams,
    /// whichever comes first. Hitting the startup timeout is not an error.
    pub async fn start(&self, config: &str) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(RunningCore::is_alive) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let version = get_version(&self.executable).await;
        info!(
            "Starting core {} (version {})",
            self.executable.display(),
            version.as_deref().unwrap_or("unknown")
        );
        *self
            .last_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = version;

        let mut child = Command::new(&self.executable)
            .args(["run", "-config", "stdin:"])
            .env("XRAY_LOCATION_ASSET", &self.assets_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {}", self.executable.display(), e);
                SupervisorError::Spawn(e.to_string())
            })?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("child exited before reporting a pid".into()))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(config.as_bytes()).await {
                // The child may already be gone; the pump reports it.
                warn!("Failed to write configuration to core stdin: {}", e);
            }
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Spawn("stderr was not captured".into()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let planned = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(pump(PumpContext {
            child,
            stdout,
            stderr,
            generation,
            planned: planned.clone(),
            exited: exited.clone(),
            ready_tx: Some(ready_tx),
            log_hub: self.log_hub.clone(),
            meta_cache: self.meta_cache.clone(),
            stop_tx: self.stop_tx.clone(),
        }));

        *state = Some(RunningCore {
            pid,
            generation,
            planned,
            exited,
        });

        match tokio::time::timeout(self.startup_timeout, ready_rx).await {
            Ok(Ok(())) => info!("Core {} is up (pid {})", generation, pid),
            Ok(Err(_)) => warn!("Core {} output ended during startup", generation),
            Err(_) => warn!(
                "Core {} did not report readiness within {:?}, continuing",
                generation, self.startup_timeout
            ),
        }
        Ok(())
    }

    /// Terminates the core: SIGTERM, then SIGKILL after the stop timeout.
    ///
    /// When nothing is running only the log subscribers are closed.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        let running = match state.take() {
            Some(running) if running.is_alive() => running,
            _ => {
                debug!("Stop requested but no core is running");
                self.log_hub.close_subscribers();
                return Ok(());
            }
        };

        info!("Stopping core {} (pid {})", running.generation, running.pid);
        running.planned.store(true, Ordering::SeqCst);
        let mut stop_rx = self.stop_tx.subscribe();

        signal(running.pid, Signal::SIGTERM)?;
        if self.wait_exit(&mut stop_rx, running.generation, self.stop_timeout).await {
            debug!("Core {} terminated gracefully", running.generation);
            return Ok(());
        }

        warn!(
            "Core {} did not terminate within {:?}, sending SIGKILL",
            running.generation, self.stop_timeout
        );
        signal(running.pid, Signal::SIGKILL)?;
        if !self.wait_exit(&mut stop_rx, running.generation, self.stop_timeout).await {
            error!(
                "Core {} still has open output streams after SIGKILL",
                running.generation
            );
        }
        Ok(())
    }

    async fn wait_exit(
        &self,
        stop_rx: &mut watch::Receiver<StopSignal>,
        generation: u64,
        limit: Duration,
    ) -> bool {
        matches!(
            tokio::time::timeout(limit, stop_rx.wait_for(|s| s.generation >= generation)).await,
            Ok(Ok(_))
        )
    }

    pub async fn restart(&self, config: &str) -> Result<(), SupervisorError> {
        self.stop().await?;
        self.start(config).await
    }

    pub async fn running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(RunningCore::is_alive)
    }

    /// Snapshot of the running process, if any.
    pub async fn current(&self) -> Option<RunningCore> {
        self.state.lock().await.clone().filter(RunningCore::is_alive)
    }

    /// Version reported by the executable at the last start.
    pub fn version(&self) -> Option<String> {
        self.last_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receiver of the level-triggered stop signal.
    pub fn stop_signal(&self) -> watch::Receiver<StopSignal> {
        self.stop_tx.subscribe()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        self.log_hub.subscribe()
    }

    pub fn get_buffer(&self) -> Vec<String> {
        self.log_hub.get_buffer()
    }

    pub fn get_last_meta(&self) -> HashMap<u32, String> {
        self.meta_cache.get_last_meta()
    }
}

fn signal(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    let raw = i32::try_from(pid).map_err(|e| SupervisorError::Signal(e.to_string()))?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(()),
        // Already gone; the pump will publish the exit.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Signal(format!("{:?}: {}", signal, e))),
    }
}

struct PumpContext {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    generation: u64,
    planned: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    ready_tx: Option<oneshot::Sender<()>>,
    log_hub: Arc<LogHub>,
    meta_cache: Arc<ConnectionMetaCache>,
    stop_tx: watch::Sender<StopSignal>,
}

/// Reads both output streams line by line until both end.
async fn drain_output<O, E, F>(stdout: O, stderr: E, mut on_line: F)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let (mut stdout_open, mut stderr_open) = (true, true);

    while stdout_open || stderr_open {
        tokio::select! {
            next = stdout.next_line(), if stdout_open => match next {
                Ok(Some(line)) => on_line(line),
                _ => stdout_open = false,
            },
            next = stderr.next_line(), if stderr_open => match next {
                Ok(Some(line)) => on_line(line),
                _ => stderr_open = false,
            },
        }
    }
}

/// Forwards the child's output until it closes, then reaps the child.
async fn pump(mut ctx: PumpContext) {
    let generation = ctx.generation;
    let log_hub = ctx.log_hub.clone();
    let meta_cache = ctx.meta_cache.clone();
    let mut ready_tx = ctx.ready_tx.take();

    drain_output(ctx.stdout, ctx.stderr, |line| {
        trace!("[core:{}] {}", generation, line);
        if ready_tx.is_some() && is_started_banner(&line) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
        log_hub.publish(&line);
        meta_cache.handle_line(&line);
    })
    .await;
    drop(ready_tx);

    match ctx.child.wait().await {
        Ok(status) => debug!("Core {} exited with {}", ctx.generation, status),
        Err(e) => warn!("Failed to reap core {}: {}", ctx.generation, e),
    }

    ctx.exited.store(true, Ordering::SeqCst);
    ctx.log_hub.close_subscribers();

    let reason = if ctx.planned.load(Ordering::SeqCst) {
        StopReason::Planned
    } else {
        warn!("Core {} exited unexpectedly", ctx.generation);
        StopReason::Crashed
    };
    ctx.stop_tx.send_replace(StopSignal {
        generation: ctx.generation,
        reason,
    });
}

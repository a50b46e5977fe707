//! Capture Session Supervisor
//!
//! One tokio task per session owns the worker child process. Commands
//! (restart, shutdown) arrive over a channel, so process exit, restart and
//! disposal are handled one at a time by that task and never race.
//!
//! ```text
//! Stopped ──► Starting ──► Running ──(exit)──► Failed ──(delay)──► Starting
//!                             │
//!                             └──(shutdown)──► Stopping ──► Stopped
//! ```

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::args::CaptureParameters;
use super::console::Console;
use crate::error::WorkerError;
use crate::session::SessionId;
use crate::shm::{ControlBlock, Flag};

/// Lifecycle of the supervised worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running { pid: Option<u32> },
    Stopping,
    /// Last start attempt or run ended; a restart is scheduled
    Failed { reason: String },
}

/// How to end a running worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Raise `AbortRequested`, wait for the worker to exit, kill on timeout
    Graceful,
    /// Raise `AbortRequested` and kill immediately
    Kill,
}

/// Restart delay policy: a fixed base delay, skipped once after an explicit restart
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base, next: base }
    }

    /// A worker started; the next crash waits the full base delay
    pub fn on_start(&mut self) {
        self.next = self.base;
    }

    /// Explicit restart; the next wait is zero
    pub fn force_immediate(&mut self) {
        self.next = Duration::ZERO;
    }

    /// Delay to use now; a forced zero applies only once
    pub fn take_delay(&mut self) -> Duration {
        std::mem::replace(&mut self.next, self.base)
    }

    pub fn peek(&self) -> Duration {
        self.next
    }
}

/// Static launch settings shared by every supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    /// Arguments placed before the capture verb (e.g. a wrapper's own arguments)
    pub leading_args: Vec<String>,
    pub restart_delay: Duration,
    pub graceful_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("capture-worker"),
            leading_args: Vec::new(),
            restart_delay: Duration::from_millis(1000),
            graceful_timeout: Duration::from_secs(5),
        }
    }
}

/// Invoked before every start attempt
pub type StartingHook = Arc<dyn Fn(SessionId) + Send + Sync>;

enum Request {
    Restart(Option<CaptureParameters>),
    Shutdown(StopMode),
}

/// Handle to a running supervisor task
pub struct Supervisor {
    session: SessionId,
    commands: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SupervisorState>,
    task: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn the supervisor task; the first start attempt happens immediately
    pub fn start(
        session: SessionId,
        config: SupervisorConfig,
        params: CaptureParameters,
        control: Arc<ControlBlock>,
        console: Console,
        on_starting: Option<StartingHook>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SupervisorState::Stopped);
        let runner = Runner {
            session,
            backoff: Backoff::new(config.restart_delay),
            config,
            params,
            control,
            console,
            on_starting,
            commands: rx,
            state: state_tx,
        };
        let task = tokio::spawn(runner.run());
        Self {
            session,
            commands,
            state,
            task: Some(task),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Kill the current worker and start again at once, optionally with new parameters
    pub fn restart(&self, params: Option<CaptureParameters>) {
        let _ = self.commands.send(Request::Restart(params));
    }

    /// Stop the worker in the background; the caller never waits
    pub fn shutdown(mut self, mode: StopMode) -> Option<JoinHandle<()>> {
        let _ = self.commands.send(Request::Shutdown(mode));
        self.task.take()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Request::Shutdown(StopMode::Graceful));
        }
    }
}

struct Runner {
    session: SessionId,
    config: SupervisorConfig,
    params: CaptureParameters,
    control: Arc<ControlBlock>,
    console: Console,
    on_starting: Option<StartingHook>,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Request>,
    state: watch::Sender<SupervisorState>,
}

/// What ended a wait inside the runner
enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Restart(Option<CaptureParameters>),
    Shutdown(StopMode),
}

impl Runner {
    fn publish(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        loop {
            if let Some(hook) = &self.on_starting {
                hook(self.session);
            }
            self.publish(SupervisorState::Starting);
            self.control.set_flag(Flag::AbortRequested, false);

            match self.spawn() {
                Ok(child) => {
                    self.backoff.on_start();
                    if let Some(stop) = self.supervise(child).await {
                        self.finish(stop);
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(session = self.session, "Worker start failed: {}", err);
                    self.console.log_timestamped(&format!("Start failed: {err}"));
                    self.publish(SupervisorState::Failed {
                        reason: err.to_string(),
                    });
                }
            }

            let delay = self.backoff.take_delay();
            if !delay.is_zero() {
                tracing::debug!(session = self.session, "Restarting worker in {:?}", delay);
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                command = self.commands.recv() => match command {
                    Some(Request::Restart(params)) => self.replace_params(params),
                    Some(Request::Shutdown(_)) | None => {
                        self.finish(StopMode::Kill);
                        return;
                    }
                },
            }
        }
    }

    fn replace_params(&mut self, params: Option<CaptureParameters>) {
        if let Some(params) = params {
            self.params = params;
        }
    }

    fn spawn(&self) -> Result<Child, WorkerError> {
        let args = self.params.to_args();
        tracing::info!(
            session = self.session,
            "Starting {} {}",
            self.config.program.display(),
            self.params.command_line()
        );

        let mut child = Command::new(&self.config.program)
            .args(&self.config.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.config.program.display().to_string(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let console = self.console.clone();
            let session = self.session;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::info!(target: "worker", session, "{}", line.trim());
                    console.log_timestamped(&line);
                }
            });
        }

        Ok(child)
    }

    /// Run until the child exits (returns `None`) or a shutdown is requested
    async fn supervise(&mut self, mut child: Child) -> Option<StopMode> {
        self.publish(SupervisorState::Running { pid: child.id() });

        loop {
            let wake = tokio::select! {
                status = child.wait() => Wake::Exited(status),
                command = self.commands.recv() => match command {
                    Some(Request::Restart(params)) => Wake::Restart(params),
                    Some(Request::Shutdown(mode)) => Wake::Shutdown(mode),
                    None => Wake::Shutdown(StopMode::Graceful),
                },
            };

            match wake {
                Wake::Exited(status) => {
                    let reason = match status {
                        Ok(status) => describe_exit(status),
                        Err(err) => format!("Lost worker process: {err}"),
                    };
                    tracing::warn!(session = self.session, "{}", reason);
                    self.console.log_timestamped(&reason);
                    self.publish(SupervisorState::Failed { reason });
                    return None;
                }
                Wake::Restart(params) => {
                    self.replace_params(params);
                    self.backoff.force_immediate();
                    self.stop(&mut child, StopMode::Kill).await;
                    self.publish(SupervisorState::Failed {
                        reason: "Restart requested".to_string(),
                    });
                    return None;
                }
                Wake::Shutdown(mode) => {
                    self.publish(SupervisorState::Stopping);
                    self.stop(&mut child, mode).await;
                    return Some(mode);
                }
            }
        }
    }

    async fn stop(&self, child: &mut Child, mode: StopMode) {
        self.control.set_flag(Flag::AbortRequested, true);

        if mode == StopMode::Graceful {
            match tokio::time::timeout(self.config.graceful_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(session = self.session, "{}", describe_exit(status));
                    return;
                }
                Ok(Err(err)) => {
                    tracing::warn!(session = self.session, "Waiting for worker failed: {}", err);
                }
                Err(_) => {
                    tracing::warn!(
                        session = self.session,
                        "Worker ignored stop request for {:?}, killing",
                        self.config.graceful_timeout
                    );
                }
            }
        }

        if let Err(err) = child.kill().await {
            tracing::warn!(session = self.session, "Failed to kill worker: {}", err);
        }
    }

    fn finish(&self, mode: StopMode) {
        tracing::debug!(session = self.session, ?mode, "Supervisor stopped");
        self.publish(SupervisorState::Stopped);
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("Exited with exit code {code}"),
        None => format!("Exited ({status})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{DataFlow, Role};
    use crate::worker::args::SourceSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params() -> CaptureParameters {
        CaptureParameters::new(SourceSpec::Default {
            flow: DataFlow::Render,
            role: Role::Console,
        })
    }

    fn shell(script: &str, delay_ms: u64) -> SupervisorConfig {
        SupervisorConfig {
            program: PathBuf::from("sh"),
            leading_args: vec!["-c".to_string(), script.to_string()],
            restart_delay: Duration::from_millis(delay_ms),
            graceful_timeout: Duration::from_millis(200),
        }
    }

    fn counting_hook() -> (StartingHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        let hook: StartingHook = Arc::new(move |_| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        (hook, count)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SupervisorState>,
        pred: impl Fn(&SupervisorState) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("state not reached")
            .expect("supervisor dropped");
    }

    #[test]
    fn test_backoff_reset_and_forced_zero() {
        let base = Duration::from_millis(1000);
        let mut backoff = Backoff::new(base);
        assert_eq!(backoff.take_delay(), base);

        backoff.force_immediate();
        assert_eq!(backoff.take_delay(), Duration::ZERO);
        assert_eq!(backoff.take_delay(), base);

        backoff.force_immediate();
        backoff.on_start();
        assert_eq!(backoff.peek(), base);
    }

    #[tokio::test]
    async fn test_crashing_worker_is_restarted() {
        let control = Arc::new(ControlBlock::anonymous(64).unwrap());
        let console = Console::new(20);
        let (hook, starts) = counting_hook();
        let supervisor = Supervisor::start(
            1,
            shell("echo boom >&2; exit 3", 10),
            params(),
            control,
            console.clone(),
            Some(hook),
        );

        let mut rx = supervisor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while starts.load(Ordering::SeqCst) < 3 {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let lines = console.lines();
        assert!(lines.iter().any(|l| l.ends_with("Exited with exit code 3")));
        assert!(lines.iter().any(|l| l.ends_with("boom")));

        let task = supervisor.shutdown(StopMode::Kill).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let control = Arc::new(ControlBlock::anonymous(64).unwrap());
        let config = SupervisorConfig {
            program: PathBuf::from("/nonexistent/capture-worker"),
            restart_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let supervisor = Supervisor::start(2, config, params(), control, Console::new(4), None);
        let mut rx = supervisor.subscribe();
        wait_for(&mut rx, |s| matches!(s, SupervisorState::Failed { .. })).await;
        supervisor.shutdown(StopMode::Kill).unwrap().await.unwrap();
        assert_eq!(*rx.borrow(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_raises_abort() {
        let control = Arc::new(ControlBlock::anonymous(64).unwrap());
        let supervisor = Supervisor::start(
            3,
            shell("sleep 30", 10),
            params(),
            Arc::clone(&control),
            Console::new(4),
            None,
        );
        let mut rx = supervisor.subscribe();
        wait_for(&mut rx, |s| matches!(s, SupervisorState::Running { .. })).await;
        assert!(!control.flag(Flag::AbortRequested));

        supervisor.shutdown(StopMode::Graceful).unwrap().await.unwrap();
        assert!(control.flag(Flag::AbortRequested));
        assert_eq!(*rx.borrow(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_explicit_restart_is_immediate() {
        let control = Arc::new(ControlBlock::anonymous(64).unwrap());
        let (hook, starts) = counting_hook();
        let supervisor = Supervisor::start(
            4,
            shell("sleep 30", 60_000),
            params(),
            control,
            Console::new(4),
            Some(hook),
        );
        let mut rx = supervisor.subscribe();
        wait_for(&mut rx, |s| matches!(s, SupervisorState::Running { .. })).await;

        let mut new_params = params();
        new_params.sample_rate = Some(44100);
        supervisor.restart(Some(new_params));

        wait_for(&mut rx, |s| {
            matches!(s, SupervisorState::Running { .. }) && starts.load(Ordering::SeqCst) == 2
        })
        .await;

        supervisor.shutdown(StopMode::Kill).unwrap().await.unwrap();
    }
}

//! Launch → wait → maybe relaunch loop for one external process.
//!
//! Every supervised process gets its own thread. The thread exclusively owns
//! the child; the outside world talks to it through a stop channel and sees
//! it through an atomic state, an [`InputPipe`] that only holds the child's
//! stdin while it is Running, and optional [`SupervisorEvent`]s.

use crate::core::input_pipe::InputPipe;
use crate::core::launcher::{ChildProcess, CommandSpec, ExitInfo, ProcessLauncher};
use crate::core::output_monitor;
use crate::error::Error;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

// Upper bound on how late a stop request or a child exit is noticed.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

const STATE_STOPPED: usize = 0;
const STATE_STARTING: usize = 1;
const STATE_RUNNING: usize = 2;
const STATE_STOPPING: usize = 3;
const STATE_CRASHED: usize = 4;

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ProcessState {
    fn from_usize(value: usize) -> Self {
        match value {
            STATE_STARTING => ProcessState::Starting,
            STATE_RUNNING => ProcessState::Running,
            STATE_STOPPING => ProcessState::Stopping,
            STATE_CRASHED => ProcessState::Crashed,
            _ => ProcessState::Stopped,
        }
    }
}

/// Delay schedule between relaunches.
///
/// The n-th consecutive restart waits `initial * multiplier^(n-1)`, capped at
/// `max`. A process that stayed up for `stable_after` resets the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    max_restarts: Option<u32>,
    stable_after: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2,
            max_restarts: None,
            stable_after: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relaunch right away, every time.
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn set_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub fn set_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn set_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    /// Gives up after this many consecutive restarts. Unlimited by default.
    pub fn set_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = Some(max_restarts);
        self
    }

    pub fn set_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    pub fn max_restarts(&self) -> Option<u32> {
        self.max_restarts
    }

    /// Delay before the `consecutive`-th restart in a row (1-based).
    pub fn delay(&self, consecutive: u32) -> Duration {
        let exponent = consecutive.saturating_sub(1);
        let factor = self
            .multiplier
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// What happens after a supervised process exits on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Run once; the exit is final.
    Once,
    /// Relaunch with identical arguments after the backoff delay.
    Restart(Backoff),
}

impl RestartPolicy {
    pub fn restart() -> Self {
        RestartPolicy::Restart(Backoff::default())
    }
}

/// Runtime notifications of a supervisor. Failures inside the supervision
/// loop are reported here and in the log, never to the frame path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { name: String, pid: u32, attempt: u32 },
    Exited { name: String, exit: ExitInfo },
    Restarting { name: String, attempt: u32, delay: Duration },
    LaunchFailed { name: String, error: String },
    /// The exit status could not be collected; the child was killed.
    WaitFailed { name: String, error: String },
    GaveUp { name: String, restarts: u32 },
    Stopped { name: String },
}

/// Publishing side of a supervisor event channel.
///
/// Never blocks. On a full bounded channel built with
/// [`EventSender::bounded`] the oldest queued event is discarded, so a late
/// reader sees the most recent history.
#[derive(Clone)]
pub struct EventSender {
    sender: Sender<SupervisorEvent>,
    // Present when the oldest event may be discarded to make room.
    oldest: Option<Receiver<SupervisorEvent>>,
}

impl EventSender {
    /// A channel holding at most `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<SupervisorEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let events = Self {
            sender,
            oldest: Some(receiver.clone()),
        };
        (events, receiver)
    }

    pub fn send(&self, event: SupervisorEvent) {
        match self.sender.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                if let Some(oldest) = &self.oldest {
                    let _ = oldest.try_recv();
                    let _ = self.sender.try_send(event);
                }
            }
        }
    }
}

impl From<Sender<SupervisorEvent>> for EventSender {
    fn from(sender: Sender<SupervisorEvent>) -> Self {
        Self {
            sender,
            oldest: None,
        }
    }
}

#[derive(Clone)]
pub struct Initialization;
#[derive(Clone)]
pub struct Running;
#[derive(Clone)]
pub struct Ended;

/// Supervises one external process.
///
/// # Example
///
/// ```rust,ignore
/// let supervisor = ProcessSupervisor::new(
///     "ffserver",
///     CommandSpec::new("ffserver").args(["-f", "/data/ffserver.conf"]),
///     RestartPolicy::restart(),
///     Arc::new(SystemLauncher),
/// )
/// .run()?;
///
/// // ... later
/// supervisor.stop();
/// ```
pub struct ProcessSupervisor<S> {
    name: String,
    command: CommandSpec,
    policy: RestartPolicy,
    launcher: Arc<dyn ProcessLauncher>,
    input: InputPipe,
    state: Arc<AtomicUsize>,
    pid: Arc<AtomicU32>,
    launches: Arc<AtomicU32>,
    events: Option<EventSender>,
    forward_output: bool,
    stop_grace: Duration,
    stop_sender: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    _state: PhantomData<S>,
}

impl<S> ProcessSupervisor<S> {
    fn into_state<T>(mut self) -> ProcessSupervisor<T> {
        ProcessSupervisor {
            name: std::mem::take(&mut self.name),
            command: self.command.clone(),
            policy: self.policy.clone(),
            launcher: self.launcher.clone(),
            input: self.input.clone(),
            state: self.state.clone(),
            pid: self.pid.clone(),
            launches: self.launches.clone(),
            events: self.events.take(),
            forward_output: self.forward_output,
            stop_grace: self.stop_grace,
            stop_sender: self.stop_sender.take(),
            worker: self.worker.take(),
            _state: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_usize(self.state.load(Ordering::Acquire))
    }

    /// Number of launch attempts so far, including failed ones.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::Acquire)
    }

    /// Stdin of the child, present only while it is Running.
    pub fn input(&self) -> InputPipe {
        self.input.clone()
    }
}

impl ProcessSupervisor<Initialization> {
    pub fn new(
        name: impl Into<String>,
        command: CommandSpec,
        policy: RestartPolicy,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            policy,
            launcher,
            input: InputPipe::new(),
            state: Arc::new(AtomicUsize::new(STATE_STOPPED)),
            pid: Arc::new(AtomicU32::new(0)),
            launches: Arc::new(AtomicU32::new(0)),
            events: None,
            forward_output: true,
            stop_grace: DEFAULT_STOP_GRACE,
            stop_sender: None,
            worker: None,
            _state: PhantomData,
        }
    }

    /// Publishes lifecycle events on `sender`.
    pub fn set_event_sender(mut self, sender: impl Into<EventSender>) -> Self {
        self.events = Some(sender.into());
        self
    }

    /// How long [`stop`](ProcessSupervisor<Running>::stop) waits for a graceful
    /// exit before killing the child.
    pub fn set_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Uses `input` as the stdin slot, so writers holding a clone keep working
    /// across supervisors.
    pub fn set_input(mut self, input: InputPipe) -> Self {
        self.input = input;
        self
    }

    /// Forward the child's output to the log (default) or just discard it.
    pub fn set_forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    /// Starts the supervision thread and waits for the first launch attempt.
    ///
    /// # Returns
    ///
    /// * The running supervisor once the first child exists.
    /// * [`Error::LaunchFailure`] if the first launch failed; nothing is retried.
    pub fn run(mut self) -> crate::error::Result<ProcessSupervisor<Running>> {
        let (stop_sender, stop_receiver) = crossbeam_channel::bounded(1);
        let (ready_sender, ready_receiver) = crossbeam_channel::bounded(1);

        let worker = Worker {
            name: self.name.clone(),
            command: self.command.clone(),
            policy: self.policy.clone(),
            launcher: self.launcher.clone(),
            input: self.input.clone(),
            state: self.state.clone(),
            pid: self.pid.clone(),
            launches: self.launches.clone(),
            events: self.events.clone(),
            forward_output: self.forward_output,
            stop_grace: self.stop_grace,
            stop_receiver,
        };

        let thread_name = format!("{}-supervisor", self.name);
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker.supervise(ready_sender))
            .map_err(|source| Error::ThreadSpawn {
                name: thread_name,
                source,
            })?;

        match ready_receiver.recv() {
            Ok(Ok(pid)) => {
                debug!("{} supervisor running (pid {pid})", self.name);
                self.stop_sender = Some(stop_sender);
                self.worker = Some(handle);
                Ok(self.into_state())
            }
            Ok(Err(source)) => {
                let _ = handle.join();
                Err(Error::LaunchFailure {
                    program: self.command.program().to_string(),
                    source,
                })
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::LaunchFailure {
                    program: self.command.program().to_string(),
                    source: io::Error::other("supervisor thread exited before launching"),
                })
            }
        }
    }
}

impl ProcessSupervisor<Running> {
    /// Pid of the current child, if one is Running.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Whether the supervision loop is still alive (Running, or between restarts).
    pub fn is_supervising(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stops the child and the supervision loop.
    ///
    /// Closes the child's stdin, asks it to terminate, kills it if it is still
    /// alive after the grace period, and returns once the supervision thread
    /// is gone. A pending restart delay is cut short.
    pub fn stop(mut self) -> ProcessSupervisor<Ended> {
        if let Some(sender) = self.stop_sender.take() {
            // Fails only when the loop already ended on its own.
            let _ = sender.try_send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Thread[{}-supervisor] panicked", self.name);
            }
        }
        // Covers a loop that ended without passing through its own cleanup.
        self.input.release();
        self.into_state()
    }
}

impl ProcessSupervisor<Ended> {
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.state(),
            ProcessState::Stopped | ProcessState::Crashed
        )
    }
}

enum Outcome {
    Exited(ExitInfo),
    StopRequested,
    WaitFailed(io::Error),
}

struct Worker {
    name: String,
    command: CommandSpec,
    policy: RestartPolicy,
    launcher: Arc<dyn ProcessLauncher>,
    input: InputPipe,
    state: Arc<AtomicUsize>,
    pid: Arc<AtomicU32>,
    launches: Arc<AtomicU32>,
    events: Option<EventSender>,
    forward_output: bool,
    stop_grace: Duration,
    stop_receiver: Receiver<()>,
}

impl Worker {
    fn set_state(&self, state: usize) {
        self.state.store(state, Ordering::Release);
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    fn supervise(self, ready: Sender<io::Result<u32>>) {
        let mut ready = Some(ready);
        let mut consecutive = 0u32;

        loop {
            self.set_state(STATE_STARTING);
            let attempt = self.launches.fetch_add(1, Ordering::AcqRel) + 1;

            let mut child = match self.launcher.launch(&self.command) {
                Ok(child) => child,
                Err(e) => {
                    error!("{} could not be launched ({}): {e}", self.name, self.command);
                    self.set_state(STATE_CRASHED);
                    self.emit(SupervisorEvent::LaunchFailed {
                        name: self.name.clone(),
                        error: e.to_string(),
                    });
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                    }
                    return;
                }
            };

            let pid = child.id();
            if let Some(stdin) = child.take_stdin() {
                self.input.install(stdin);
            }
            if let Some(output) = child.take_output() {
                if let Err(e) = output_monitor::spawn(&self.name, output, self.forward_output) {
                    warn!("{}: cannot drain process output: {e}", self.name);
                }
            }
            self.pid.store(pid, Ordering::Release);
            self.set_state(STATE_RUNNING);
            info!("{} has been started (pid {pid}, attempt {attempt})", self.name);
            self.emit(SupervisorEvent::Started {
                name: self.name.clone(),
                pid,
                attempt,
            });
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(pid));
            }

            let started_at = Instant::now();
            let outcome = self.wait_for_exit(child.as_mut());
            if let Outcome::StopRequested = outcome {
                // A writer blocked on a full pipe keeps the slot until the child dies.
                if !self.input.try_release() {
                    debug!("{}: stdin busy, closing it after shutdown", self.name);
                }
                self.pid.store(0, Ordering::Release);
                self.shutdown(child.as_mut());
                self.input.release();
                return;
            }
            self.input.release();
            self.pid.store(0, Ordering::Release);

            let exit = match outcome {
                Outcome::StopRequested => return,
                Outcome::WaitFailed(e) => {
                    error!("{}: waiting for process exit failed: {e}", self.name);
                    if let Err(e) = child.kill() {
                        warn!("{}: kill failed: {e}", self.name);
                    }
                    // Reap it, or it lingers as a zombie.
                    if let Err(e) = child.wait() {
                        warn!("{}: reaping failed: {e}", self.name);
                    }
                    self.set_state(STATE_CRASHED);
                    self.emit(SupervisorEvent::WaitFailed {
                        name: self.name.clone(),
                        error: e.to_string(),
                    });
                    return;
                }
                Outcome::Exited(exit) => exit,
            };

            warn!(
                "{}",
                Error::UnexpectedExit {
                    name: self.name.clone(),
                    exit,
                }
            );
            self.emit(SupervisorEvent::Exited {
                name: self.name.clone(),
                exit,
            });

            let backoff = match &self.policy {
                RestartPolicy::Once => {
                    self.set_state(if exit.success() {
                        STATE_STOPPED
                    } else {
                        STATE_CRASHED
                    });
                    self.emit(SupervisorEvent::Stopped {
                        name: self.name.clone(),
                    });
                    return;
                }
                RestartPolicy::Restart(backoff) => backoff,
            };

            self.set_state(STATE_CRASHED);
            if started_at.elapsed() >= backoff.stable_after {
                consecutive = 0;
            }
            consecutive += 1;

            if let Some(max) = backoff.max_restarts() {
                if consecutive > max {
                    error!("{} exited {max} times in a row, giving up", self.name);
                    self.emit(SupervisorEvent::GaveUp {
                        name: self.name.clone(),
                        restarts: max,
                    });
                    return;
                }
            }

            let delay = backoff.delay(consecutive);
            info!("{} will be relaunched in {delay:?}", self.name);
            self.emit(SupervisorEvent::Restarting {
                name: self.name.clone(),
                attempt: attempt + 1,
                delay,
            });

            let stop = if delay.is_zero() {
                !matches!(
                    self.stop_receiver.try_recv(),
                    Err(crossbeam_channel::TryRecvError::Empty)
                )
            } else {
                !matches!(
                    self.stop_receiver.recv_timeout(delay),
                    Err(RecvTimeoutError::Timeout)
                )
            };
            if stop {
                debug!("{}: stop requested during restart delay", self.name);
                self.set_state(STATE_STOPPED);
                self.emit(SupervisorEvent::Stopped {
                    name: self.name.clone(),
                });
                return;
            }
        }
    }

    /// Waits for the child to exit or a stop request, whichever comes first.
    /// A dropped supervisor handle counts as a stop request.
    fn wait_for_exit(&self, child: &mut dyn ChildProcess) -> Outcome {
        loop {
            match child.try_wait() {
                Ok(Some(exit)) => return Outcome::Exited(exit),
                Ok(None) => {}
                Err(e) => return Outcome::WaitFailed(e),
            }
            match self.stop_receiver.recv_timeout(EXIT_POLL_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Outcome::StopRequested,
            }
        }
    }

    fn shutdown(&self, child: &mut dyn ChildProcess) {
        self.set_state(STATE_STOPPING);
        info!("Stopping {}...", self.name);

        if let Err(e) = child.terminate() {
            debug!("{}: terminate request failed: {e}", self.name);
        }

        let deadline = Instant::now() + self.stop_grace;
        let mut exit = None;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit = Some(status);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("{}: polling for exit failed: {e}", self.name);
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }

        let exit = match exit {
            Some(exit) => Some(exit),
            None => {
                warn!(
                    "{} did not exit within {:?}, killing it",
                    self.name, self.stop_grace
                );
                if let Err(e) = child.kill() {
                    warn!("{}: kill failed: {e}", self.name);
                }
                child.wait().ok()
            }
        };

        match exit {
            Some(exit) => info!("{} has stopped ({exit})", self.name),
            None => info!("{} has stopped", self.name),
        }
        self.set_state(STATE_STOPPED);
        self.emit(SupervisorEvent::Stopped {
            name: self.name.clone(),
        });
    }
}

//! Session orchestration: the relay server comes up before the transcoder and
//! goes down after it.

use crate::config::RelayConfig;
use crate::core::launcher::{ProcessLauncher, SystemLauncher};
use crate::core::stream_params::StreamParameters;
use crate::core::supervisor::{EventSender, ProcessState, SupervisorEvent};
use crate::error::{Error, Result};
use crate::server::StreamServerManager;
use crate::transcoder::{FeederStats, FrameSink, TranscoderFeeder};
use crossbeam_channel::Receiver;
use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Beyond this many unread events the oldest ones are discarded.
const EVENT_CAPACITY: usize = 256;

/// One streaming session: a relay server, a transcoder and the parameters both
/// were started with.
struct Session {
    params: StreamParameters,
    server: StreamServerManager,
    transcoder: TranscoderFeeder,
}

/// Relays raw frames into a live RTSP stream.
///
/// The host owns the frame source and drives the relay with
/// [`start_session`](Self::start_session), [`on_frame_available`](Self::on_frame_available)
/// and [`stop_session`](Self::stop_session). All methods take `&self`, so the
/// relay can be shared (`Arc<FrameRelay>`) between a control thread and a
/// capture thread.
///
/// # Example
///
/// ```rust,ignore
/// let relay = FrameRelay::new(RelayConfig::new(cache_dir).set_bin_dir(bin_dir));
/// let params = StreamParameters::builder()
///     .video_size(640, 480)
///     .frame_rate(15)
///     .build()?;
///
/// relay.start_session(params)?;
/// // From the capture callback:
/// relay.on_frame_available(&frame);
/// // ...
/// relay.stop_session();
/// ```
pub struct FrameRelay {
    config: RelayConfig,
    launcher: Arc<dyn ProcessLauncher>,
    session: Mutex<Option<Session>>,
    sink: RwLock<Option<FrameSink>>,
    event_sender: EventSender,
    event_receiver: Receiver<SupervisorEvent>,
}

impl FrameRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    /// Uses `launcher` to start the processes instead of `std::process`.
    pub fn with_launcher(config: RelayConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (event_sender, event_receiver) = EventSender::bounded(EVENT_CAPACITY);
        Self {
            config,
            launcher,
            session: Mutex::new(None),
            sink: RwLock::new(None),
            event_sender,
            event_receiver,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lifecycle events of both processes, across sessions.
    pub fn events(&self) -> Receiver<SupervisorEvent> {
        self.event_receiver.clone()
    }

    /// Starts the relay server, then the transcoder.
    ///
    /// # Errors
    ///
    /// * [`Error::SessionAlreadyActive`] if a session is running; it is left
    ///   untouched.
    /// * [`Error::ConfigWrite`] if the server configuration could not be
    ///   written. Nothing is launched.
    /// * [`Error::LaunchFailure`] if either binary could not be started. A
    ///   server that was already started is stopped again.
    pub fn start_session(&self, params: StreamParameters) -> Result<()> {
        let mut session = self.session();
        if session.is_some() {
            return Err(Error::SessionAlreadyActive);
        }

        let mut server = StreamServerManager::new(&self.config, self.launcher.clone())
            .set_event_sender(self.event_sender.clone());
        server.start(&params)?;

        let mut transcoder = TranscoderFeeder::new(&self.config, self.launcher.clone())
            .set_event_sender(self.event_sender.clone());
        if let Err(e) = transcoder.start(&params) {
            warn!("Transcoder failed to start, stopping relay server");
            server.stop();
            return Err(e);
        }

        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(transcoder.sink());
        info!(
            "Session started: {} @ {} fps, rtsp://<host>:{}/{}",
            params.video_size(),
            params.frame_rate(),
            params.rtsp_port(),
            crate::server::config::STREAM_NAME
        );
        *session = Some(Session {
            params,
            server,
            transcoder,
        });
        Ok(())
    }

    /// Stops the transcoder, then the relay server. Does nothing without an
    /// active session.
    ///
    /// The session stays registered until both processes are gone, so a
    /// concurrent [`start_session`](Self::start_session) waits for the stop to
    /// finish instead of overlapping with it.
    pub fn stop_session(&self) {
        let mut guard = self.session();
        let Some(session) = guard.as_mut() else {
            return;
        };
        // Stopping the transcoder first unblocks a push stuck on a full pipe.
        session.transcoder.stop();
        self.sink.write().unwrap_or_else(PoisonError::into_inner).take();
        session.server.stop();
        let stats = session.transcoder.stats();
        *guard = None;
        drop(guard);

        info!(
            "Session stopped: {} frames written, {} dropped",
            stats.frames_written, stats.frames_dropped
        );
    }

    /// Forwards one frame to the transcoder. A no-op without an active
    /// session; never fails.
    pub fn on_frame_available(&self, frame: &[u8]) {
        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink.as_ref() {
            sink.push(frame);
        }
    }

    pub fn is_active(&self) -> bool {
        self.session().is_some()
    }

    /// Parameters of the active session.
    pub fn params(&self) -> Option<StreamParameters> {
        self.session().as_ref().map(|s| s.params.clone())
    }

    /// `(server, transcoder)` states; both Stopped without a session.
    pub fn process_states(&self) -> (ProcessState, ProcessState) {
        match self.session().as_ref() {
            Some(s) => (s.server.state(), s.transcoder.state()),
            None => (ProcessState::Stopped, ProcessState::Stopped),
        }
    }

    /// Frame counters of the active session.
    pub fn stats(&self) -> Option<FeederStats> {
        self.session().as_ref().map(|s| s.transcoder.stats())
    }
}

impl Drop for FrameRelay {
    fn drop(&mut self) {
        self.stop_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{Script, ScriptedLauncher};
    use std::path::PathBuf;
    use std::time::Duration;

    fn e2e_params() -> StreamParameters {
        StreamParameters::builder()
            .video_size(640, 480)
            .frame_rate(15)
            .bit_rate_kbps(800)
            .rtsp_port(7654)
            .feed_file_path("feed1.ffm")
            .build()
            .unwrap()
    }

    fn work_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ffrelay-relay-{name}-{}", std::process::id()))
    }

    #[test]
    fn test_session_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = work_dir("e2e");
        let launcher = Arc::new(ScriptedLauncher::new(vec![]));
        let relay = FrameRelay::with_launcher(RelayConfig::new(&dir), launcher.clone());

        relay.start_session(e2e_params()).unwrap();
        assert!(relay.is_active());
        assert_eq!(
            relay.process_states(),
            (ProcessState::Running, ProcessState::Running)
        );

        let launches = launcher.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].program(), "ffserver");
        assert_eq!(
            launches[0].get_args(),
            &["-f".to_string(), dir.join("ffserver.conf").to_string_lossy().to_string()]
        );
        assert_eq!(launches[1].program(), "ffmpeg");
        let args = launches[1].get_args();
        assert!(args.windows(2).any(|w| w[0] == "-video_size" && w[1] == "640x480"));
        assert_eq!(args.last().unwrap(), "http://127.0.0.1:8090/feed1.ffm");

        let frame = vec![0x80u8; 640 * 480 * 12 / 8];
        relay.on_frame_available(&frame);
        assert_eq!(launcher.written().len(), 460_800);
        assert_eq!(relay.stats().unwrap().frames_written, 1);

        relay.stop_session();
        assert!(!relay.is_active());
        relay.on_frame_available(&frame);
        assert_eq!(launcher.written().len(), 460_800);

        let stopped = relay
            .events()
            .try_iter()
            .filter(|e| matches!(e, SupervisorEvent::Stopped { .. }))
            .count();
        assert_eq!(stopped, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let dir = work_dir("twice");
        let launcher = Arc::new(ScriptedLauncher::new(vec![]));
        let relay = FrameRelay::with_launcher(RelayConfig::new(&dir), launcher.clone());

        relay.start_session(e2e_params()).unwrap();
        let result = relay.start_session(e2e_params());
        assert!(matches!(result, Err(Error::SessionAlreadyActive)));

        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(
            relay.process_states(),
            (ProcessState::Running, ProcessState::Running)
        );
        relay.on_frame_available(&vec![0u8; 460_800]);
        assert_eq!(launcher.written().len(), 460_800);

        relay.stop_session();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_start_during_slow_stop_waits_for_it() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = work_dir("overlap");
        // The first transcoder ignores SIGTERM, so its stop runs into the grace period.
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            Script::RunUntilTerminated,
            Script::IgnoreTerminate,
        ]));
        let config = RelayConfig::new(&dir).set_stop_grace(Duration::from_millis(400));
        let relay = Arc::new(FrameRelay::with_launcher(config, launcher.clone()));
        let params = StreamParameters::builder().video_size(64, 48).build().unwrap();

        relay.start_session(params.clone()).unwrap();
        let stopper = {
            let relay = relay.clone();
            std::thread::spawn(move || relay.stop_session())
        };
        std::thread::sleep(Duration::from_millis(100));

        relay.start_session(params.clone()).unwrap();
        stopper.join().unwrap();
        assert_eq!(launcher.killed_count(), 1);
        assert_eq!(launcher.launch_count(), 4);
        assert!(relay.is_active());

        relay.on_frame_available(&vec![0u8; params.frame_size()]);
        assert_eq!(launcher.written().len(), params.frame_size());
        assert_eq!(relay.stats().unwrap().frames_written, 1);

        relay.stop_session();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_frame_without_session_is_noop() {
        let launcher = Arc::new(ScriptedLauncher::new(vec![]));
        let relay = FrameRelay::with_launcher(RelayConfig::new(work_dir("idle")), launcher.clone());

        relay.on_frame_available(&[0u8; 64]);
        relay.stop_session();
        assert_eq!(launcher.launch_count(), 0);
        assert!(relay.stats().is_none());
        assert!(relay.params().is_none());
    }

    #[test]
    fn test_transcoder_failure_stops_server() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = work_dir("rollback");
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            Script::RunUntilTerminated,
            Script::FailLaunch,
        ]));
        let relay = FrameRelay::with_launcher(RelayConfig::new(&dir), launcher.clone());

        let result = relay.start_session(e2e_params());
        assert!(matches!(result, Err(Error::LaunchFailure { ref program, .. }) if program == "ffmpeg"));
        assert!(!relay.is_active());

        let events: Vec<_> = relay.events().try_iter().collect();
        assert!(events.contains(&SupervisorEvent::Stopped {
            name: "ffserver".to_string()
        }));

        // The relay is usable again afterwards.
        relay.start_session(e2e_params()).unwrap();
        assert_eq!(launcher.launch_count(), 4);
        relay.stop_session();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_session_restarts_with_new_geometry() {
        let dir = work_dir("resize");
        let launcher = Arc::new(ScriptedLauncher::new(vec![]));
        let relay = FrameRelay::with_launcher(RelayConfig::new(&dir), launcher.clone());

        relay.start_session(e2e_params()).unwrap();
        relay.stop_session();

        let small = StreamParameters::builder().video_size(320, 240).build().unwrap();
        relay.start_session(small).unwrap();
        assert_eq!(relay.params().unwrap().width(), 320);

        relay.on_frame_available(&vec![0u8; 460_800]);
        relay.on_frame_available(&vec![0u8; 115_200]);
        assert_eq!(launcher.written().len(), 115_200);
        assert_eq!(relay.stats().unwrap().frames_dropped, 1);

        let conf = std::fs::read_to_string(dir.join("ffserver.conf")).unwrap();
        assert!(conf.contains("VideoSize 320x240"));
        relay.stop_session();
        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Supervision of the transcoder (ffmpeg) and the frame pipe feeding it.
//!
//! Frames go straight from the caller into the transcoder's stdin. There is
//! no queue: a full pipe blocks the push until the transcoder catches up, and
//! a missing pipe (transcoder restarting) drops the frame.

mod command;

pub use command::TranscoderCommandBuilder;

use crate::config::{EncoderOptions, RelayConfig};
use crate::core::environment::Environment;
use crate::core::input_pipe::InputPipe;
use crate::core::launcher::{CommandSpec, ProcessLauncher};
use crate::core::stream_params::StreamParameters;
use crate::core::supervisor::{
    EventSender, ProcessState, ProcessSupervisor, RestartPolicy, Running,
};
use crate::error::{Error, Result};
use crate::server::config::feed_url;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TRANSCODER_LABEL: &str = "ffmpeg";

/// Frame counters of a feeder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeederStats {
    pub frames_written: u64,
    /// Frames not written: no transcoder running, wrong size, or a failed write.
    pub frames_dropped: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_written: AtomicU64,
    pipe_failing: AtomicBool,
    size_mismatch_reported: AtomicBool,
}

/// Cloneable handle that pushes frames into the transcoder's stdin.
///
/// Stays valid across transcoder restarts and sessions; pushes made while no
/// transcoder is Running are dropped.
#[derive(Clone)]
pub struct FrameSink {
    input: InputPipe,
    // 0 until the first session fixes the geometry.
    frame_size: Arc<AtomicUsize>,
    counters: Arc<Counters>,
}

impl FrameSink {
    fn new() -> Self {
        Self {
            input: InputPipe::new(),
            frame_size: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Writes one frame verbatim and flushes. Never fails and never panics:
    /// write errors are logged and counted, not returned.
    pub fn push(&self, frame: &[u8]) {
        let expected = self.frame_size.load(Ordering::Acquire);
        if expected != 0 && frame.len() != expected {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            if !self.counters.size_mismatch_reported.swap(true, Ordering::AcqRel) {
                warn!(
                    "Dropping frame of {} bytes, the transcoder expects {expected}",
                    frame.len()
                );
            }
            return;
        }

        match self.input.write_all(frame) {
            None => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Some(Ok(())) => {
                self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_written
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                self.counters.pipe_failing.store(false, Ordering::Release);
            }
            Some(Err(e)) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                let err = Error::PipeWrite(e);
                if self.counters.pipe_failing.swap(true, Ordering::AcqRel) {
                    debug!("{err}");
                } else {
                    warn!("{err}");
                }
            }
        }
    }

    /// Whether a transcoder is currently accepting frames.
    pub fn is_connected(&self) -> bool {
        self.input.is_available()
    }

    pub fn stats(&self) -> FeederStats {
        FeederStats {
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the transcoder alive for a session and feeds it raw frames.
pub struct TranscoderFeeder {
    binary: String,
    env: Environment,
    policy: RestartPolicy,
    stop_grace: Duration,
    forward_output: bool,
    encoder: EncoderOptions,
    launcher: Arc<dyn ProcessLauncher>,
    events: Option<EventSender>,
    sink: FrameSink,
    supervisor: Option<ProcessSupervisor<Running>>,
}

impl TranscoderFeeder {
    pub fn new(config: &RelayConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            binary: config.transcoder_binary().to_string(),
            env: config.environment(),
            policy: config.transcoder_restart().clone(),
            stop_grace: config.stop_grace(),
            forward_output: config.forward_output(),
            encoder: config.encoder().clone(),
            launcher,
            events: None,
            sink: FrameSink::new(),
            supervisor: None,
        }
    }

    pub fn set_event_sender(mut self, sender: impl Into<EventSender>) -> Self {
        self.events = Some(sender.into());
        self
    }

    /// Launches the transcoder reading `params`-sized raw frames from stdin and
    /// pushing to the relay server's feed.
    ///
    /// # Errors
    ///
    /// * [`Error::LaunchFailure`] if the transcoder binary could not be started.
    /// * [`Error::AlreadyRunning`] if the transcoder is already supervised.
    pub fn start(&mut self, params: &StreamParameters) -> Result<()> {
        if self.supervisor.is_some() {
            return Err(Error::AlreadyRunning(TRANSCODER_LABEL.to_string()));
        }

        let args = TranscoderCommandBuilder::new(feed_url())
            .with_params(params)
            .with_encoder(&self.encoder)
            .build();
        let command = CommandSpec::new(self.binary.as_str())
            .args(args)
            .set_env(self.env.clone());

        self.sink
            .frame_size
            .store(params.frame_size(), Ordering::Release);
        self.sink
            .counters
            .size_mismatch_reported
            .store(false, Ordering::Release);

        let mut supervisor = ProcessSupervisor::new(
            TRANSCODER_LABEL,
            command,
            self.policy.clone(),
            self.launcher.clone(),
        )
        .set_input(self.sink.input.clone())
        .set_stop_grace(self.stop_grace)
        .set_forward_output(self.forward_output);
        if let Some(events) = &self.events {
            supervisor = supervisor.set_event_sender(events.clone());
        }

        self.supervisor = Some(supervisor.run()?);
        info!(
            "Transcoder started, {} {} @ {} fps",
            params.video_size(),
            params.pixel_format(),
            params.frame_rate()
        );
        Ok(())
    }

    /// Writes one raw frame to the transcoder.
    ///
    /// A no-op when no transcoder is Running (before `start`, after `stop`, or
    /// inside a restart window). Pipe errors are logged, never returned.
    pub fn push_frame(&self, frame: &[u8]) {
        self.sink.push(frame);
    }

    /// A handle for pushing frames from another thread.
    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Closes the frame pipe and stops the transcoder.
    pub fn stop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.stop();
            info!("Transcoder stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn state(&self) -> ProcessState {
        self.supervisor
            .as_ref()
            .map_or(ProcessState::Stopped, |s| s.state())
    }

    pub fn stats(&self) -> FeederStats {
        self.sink.stats()
    }
}

impl Drop for TranscoderFeeder {
    fn drop(&mut self) {
        self.stop();
    }
}

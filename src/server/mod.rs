//! Supervision of the relay server (ffserver).
//!
//! The server receives the transcoder's feed on its HTTP port and republishes
//! it as an RTP stream reachable over RTSP. It must be listening before the
//! transcoder starts, because the transcoder connects to the feed right away.

pub mod config;

use crate::config::RelayConfig;
use crate::core::environment::Environment;
use crate::core::launcher::{CommandSpec, ProcessLauncher};
use crate::core::stream_params::StreamParameters;
use crate::core::supervisor::{
    EventSender, ProcessState, ProcessSupervisor, RestartPolicy, Running,
};
use crate::error::{Error, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const SERVER_LABEL: &str = "ffserver";

/// Writes the server configuration and keeps the server process alive for
/// the duration of a session.
pub struct StreamServerManager {
    binary: String,
    config_path: PathBuf,
    env: Environment,
    policy: RestartPolicy,
    stop_grace: Duration,
    forward_output: bool,
    launcher: Arc<dyn ProcessLauncher>,
    events: Option<EventSender>,
    supervisor: Option<ProcessSupervisor<Running>>,
}

impl StreamServerManager {
    pub fn new(config: &RelayConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            binary: config.server_binary().to_string(),
            config_path: config.server_config_path(),
            env: config.environment(),
            policy: config.server_restart().clone(),
            stop_grace: config.stop_grace(),
            forward_output: config.forward_output(),
            launcher,
            events: None,
            supervisor: None,
        }
    }

    pub fn set_event_sender(mut self, sender: impl Into<EventSender>) -> Self {
        self.events = Some(sender.into());
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Writes the configuration for `params`, then launches the server with
    /// `-f <config>`.
    ///
    /// # Errors
    ///
    /// * [`Error::ConfigWrite`] if the configuration could not be written; no
    ///   process is launched in that case.
    /// * [`Error::LaunchFailure`] if the server binary could not be started.
    /// * [`Error::AlreadyRunning`] if the server is already supervised.
    pub fn start(&mut self, params: &StreamParameters) -> Result<()> {
        if self.supervisor.is_some() {
            return Err(Error::AlreadyRunning(SERVER_LABEL.to_string()));
        }

        self.write_config(params)?;

        let command = CommandSpec::new(self.binary.as_str())
            .arg("-f")
            .arg(self.config_path.to_string_lossy())
            .set_env(self.env.clone());

        let mut supervisor = ProcessSupervisor::new(
            SERVER_LABEL,
            command,
            self.policy.clone(),
            self.launcher.clone(),
        )
        .set_stop_grace(self.stop_grace)
        .set_forward_output(self.forward_output);
        if let Some(events) = &self.events {
            supervisor = supervisor.set_event_sender(events.clone());
        }

        self.supervisor = Some(supervisor.run()?);
        info!(
            "Relay server started, RTSP on port {}",
            params.rtsp_port()
        );
        Ok(())
    }

    fn write_config(&self, params: &StreamParameters) -> Result<()> {
        let conf = config::render(params);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.config_path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            fs::write(&self.config_path, conf.as_bytes())
        };
        write().map_err(|source| Error::ConfigWrite {
            path: self.config_path.clone(),
            source,
        })?;
        debug!("Server config written to {}", self.config_path.display());
        Ok(())
    }

    /// Stops the server: terminate, then kill after the grace period.
    /// Does nothing if the server is not running.
    pub fn stop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.stop();
            info!("Relay server stopped");
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
}

impl Drop for StreamServerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{Script, ScriptedLauncher};

    fn params() -> StreamParameters {
        StreamParameters::builder()
            .video_size(640, 480)
            .feed_file_path("feed1.ffm")
            .build()
            .unwrap()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ffrelay-server-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_start_writes_config_then_launches() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = scratch_dir("start");
        let launcher = Arc::new(ScriptedLauncher::new(vec![]));
        let config = RelayConfig::new(&dir).set_bin_dir("/opt/relay/bin");
        let mut server = StreamServerManager::new(&config, launcher.clone());

        server.start(&params()).unwrap();
        assert!(server.is_running());

        let written = fs::read_to_string(dir.join("ffserver.conf")).unwrap();
        assert_eq!(written, config::render(&params()));

        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].program(), "ffserver");
        assert_eq!(
            launches[0].get_args(),
            &["-f".to_string(), dir.join("ffserver.conf").to_string_lossy().to_string()]
        );
        assert_eq!(launches[0].env().bin_dir(), Some(Path::new("/opt/relay/bin")));

        assert!(matches!(server.start(&params()), Err(Error::AlreadyRunning(_))));

        server.stop();
        assert_eq!(server.state(), ProcessState::Stopped);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_config_write_failure_does_not_launch() {
        let dir = scratch_dir("blocked");
        // A regular file where the work directory should be.
        fs::write(&dir, b"not a directory").unwrap();

        let launcher = Arc::new(ScriptedLauncher::new(vec![]));
        let mut server = StreamServerManager::new(&RelayConfig::new(&dir), launcher.clone());

        let result = server.start(&params());
        assert!(matches!(result, Err(Error::ConfigWrite { .. })));
        assert_eq!(launcher.launch_count(), 0);
        assert!(!server.is_running());
        let _ = fs::remove_file(&dir);
    }

    #[test]
    fn test_launch_failure_is_reported() {
        let dir = scratch_dir("missing");
        let launcher = Arc::new(ScriptedLauncher::new(vec![Script::FailLaunch]));
        let mut server = StreamServerManager::new(&RelayConfig::new(&dir), launcher.clone());

        let result = server.start(&params());
        assert!(matches!(result, Err(Error::LaunchFailure { .. })));
        assert_eq!(server.state(), ProcessState::Stopped);
        assert_eq!(launcher.launch_count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    #[ignore] // Integration test: requires ffserver on PATH
    fn test_real_ffserver() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
        let dir = scratch_dir("real");
        let mut server = StreamServerManager::new(
            &RelayConfig::new(&dir),
            Arc::new(crate::core::launcher::SystemLauncher),
        );
        server.start(&params()).unwrap();
        std::thread::sleep(Duration::from_secs(2));
        assert!(server.is_running());
        server.stop();
    }
}

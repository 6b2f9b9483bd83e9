use crate::core::environment::Environment;
use crate::core::supervisor::{RestartPolicy, DEFAULT_STOP_GRACE};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SERVER_BINARY: &str = "ffserver";
pub const DEFAULT_TRANSCODER_BINARY: &str = "ffmpeg";
pub const SERVER_CONFIG_FILE: &str = "ffserver.conf";

/// Encoder settings passed to the transcoder. The defaults trade quality for
/// the lowest possible latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderOptions {
    pub crf: u32,
    pub preset: String,
    pub tune: String,
    pub log_level: String,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            crf: 30,
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            log_level: "quiet".to_string(),
        }
    }
}

/// Host-side configuration of a [`FrameRelay`](crate::relay::FrameRelay):
/// where the private binaries live, where generated files go and how the two
/// processes are supervised.
///
/// # Example
///
/// ```rust
/// use ffrelay::{Backoff, RelayConfig, RestartPolicy};
/// use std::time::Duration;
///
/// let config = RelayConfig::new("/data/data/com.example/cache")
///     .set_bin_dir("/data/data/com.example/files")
///     .set_transcoder_restart(RestartPolicy::Restart(
///         Backoff::new().set_max(Duration::from_secs(10)),
///     ))
///     .set_stop_grace(Duration::from_secs(2));
///
/// assert!(config.server_config_path().ends_with("ffserver.conf"));
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    work_dir: PathBuf,
    bin_dir: Option<PathBuf>,
    server_binary: String,
    transcoder_binary: String,
    server_restart: RestartPolicy,
    transcoder_restart: RestartPolicy,
    stop_grace: Duration,
    forward_output: bool,
    encoder: EncoderOptions,
}

impl RelayConfig {
    /// `work_dir` is the private directory the server configuration is written to.
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            work_dir: work_dir.as_ref().to_path_buf(),
            bin_dir: None,
            server_binary: DEFAULT_SERVER_BINARY.to_string(),
            transcoder_binary: DEFAULT_TRANSCODER_BINARY.to_string(),
            server_restart: RestartPolicy::restart(),
            transcoder_restart: RestartPolicy::restart(),
            stop_grace: DEFAULT_STOP_GRACE,
            forward_output: true,
            encoder: EncoderOptions::default(),
        }
    }

    /// Directory holding the server/transcoder binaries and their libraries.
    pub fn set_bin_dir(mut self, bin_dir: impl AsRef<Path>) -> Self {
        self.bin_dir = Some(bin_dir.as_ref().to_path_buf());
        self
    }

    pub fn set_server_binary(mut self, binary: impl Into<String>) -> Self {
        self.server_binary = binary.into();
        self
    }

    pub fn set_transcoder_binary(mut self, binary: impl Into<String>) -> Self {
        self.transcoder_binary = binary.into();
        self
    }

    pub fn set_server_restart(mut self, policy: RestartPolicy) -> Self {
        self.server_restart = policy;
        self
    }

    pub fn set_transcoder_restart(mut self, policy: RestartPolicy) -> Self {
        self.transcoder_restart = policy;
        self
    }

    pub fn set_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Forward child output to the log at debug level (default `true`).
    pub fn set_forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    pub fn set_encoder(mut self, encoder: EncoderOptions) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn server_config_path(&self) -> PathBuf {
        self.work_dir.join(SERVER_CONFIG_FILE)
    }

    pub fn server_binary(&self) -> &str {
        &self.server_binary
    }

    pub fn transcoder_binary(&self) -> &str {
        &self.transcoder_binary
    }

    pub fn server_restart(&self) -> &RestartPolicy {
        &self.server_restart
    }

    pub fn transcoder_restart(&self) -> &RestartPolicy {
        &self.transcoder_restart
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    pub fn forward_output(&self) -> bool {
        self.forward_output
    }

    pub fn encoder(&self) -> &EncoderOptions {
        &self.encoder
    }

    /// Environment for both children.
    pub fn environment(&self) -> Environment {
        match &self.bin_dir {
            Some(dir) => Environment::new().set_bin_dir(dir),
            None => Environment::new(),
        }
    }
}

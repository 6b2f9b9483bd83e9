use crate::core::launcher::ExitInfo;
use std::io;
use std::path::PathBuf;

/// Result type of the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while configuring or driving a relay session.
///
/// Only [`Error::ConfigWrite`], [`Error::LaunchFailure`] and
/// [`Error::SessionAlreadyActive`] ever reach the caller of
/// [`FrameRelay::start_session`](crate::relay::FrameRelay::start_session).
/// [`Error::PipeWrite`] and [`Error::UnexpectedExit`] describe runtime
/// degradation; they are logged and published as supervisor events, never
/// returned on the frame path.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Failed to write server config to {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to launch `{program}`: {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Frame pipe write failed: {0}")]
    PipeWrite(#[source] io::Error),

    #[error("Process `{name}` exited unexpectedly ({exit})")]
    UnexpectedExit { name: String, exit: ExitInfo },

    #[error("A streaming session is already active")]
    SessionAlreadyActive,

    #[error("Process `{0}` is already running")]
    AlreadyRunning(String),

    #[error("Thread[{name}] could not be spawned: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

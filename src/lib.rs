//! **ffrelay** turns raw camera frames into a live RTSP stream by driving two
//! external processes: a relay server (`ffserver`) and a transcoder (`ffmpeg`).
//! It keeps both alive for the duration of a session and feeds the transcoder
//! over its stdin. Encoding itself is entirely the transcoder's business.
//!
//! # Architecture
//!
//! ```text
//! frame source ──on_frame_available──▶ FrameRelay ──stdin──▶ ffmpeg ──HTTP feed──▶ ffserver ──RTSP/RTP──▶ clients
//! ```
//!
//! ## Key Components
//!
//! - `FrameRelay`: session root; starts the server before the transcoder and
//!   stops them in reverse order.
//! - `StreamServerManager`: writes `ffserver.conf` and supervises the server.
//! - `TranscoderFeeder`: supervises the transcoder and owns its frame pipe.
//! - `ProcessSupervisor`: per-process launch → wait → relaunch loop on its
//!   own thread, with exponential backoff and a graceful stop.
//!
//! ## Failure Handling
//!
//! | Failure | Reported | Effect |
//! |---------|----------|--------|
//! | Config cannot be written | `start_session` returns `ConfigWrite` | nothing launched |
//! | Binary missing / exec error | `start_session` returns `LaunchFailure` | server rolled back |
//! | Process exits on its own | log + `SupervisorEvent` | relaunched after backoff |
//! | Pipe write fails | log | frame dropped, session continues |
//! | Second `start_session` | `SessionAlreadyActive` | first session untouched |
//!
//! # Example
//!
//! ```rust,ignore
//! use ffrelay::{FrameRelay, RelayConfig, StreamParameters};
//!
//! let relay = FrameRelay::new(
//!     RelayConfig::new("/data/data/com.example/cache")
//!         .set_bin_dir("/data/data/com.example/files"),
//! );
//!
//! let params = StreamParameters::builder()
//!     .video_size(640, 480)
//!     .frame_rate(15)
//!     .build()
//!     .unwrap();
//! relay.start_session(params).unwrap();
//!
//! // Once per captured frame (640 * 480 * 12 / 8 bytes of NV21):
//! relay.on_frame_available(&frame);
//!
//! // Clients connect to rtsp://<device>:7654/livefeed
//! relay.stop_session();
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod relay;
pub mod server;
pub mod source;
pub mod transcoder;

pub use crate::config::{EncoderOptions, RelayConfig};
pub use crate::core::frame_pool::{FrameBuffer, FramePool};
pub use crate::core::launcher::{ChildProcess, CommandSpec, ExitInfo, ProcessLauncher, SystemLauncher};
pub use crate::core::stream_params::{PixelFormat, StreamParameters, StreamParametersBuilder};
pub use crate::core::supervisor::{Backoff, EventSender, ProcessState, RestartPolicy, SupervisorEvent};
pub use crate::error::{Error, Result};
pub use crate::relay::FrameRelay;
pub use crate::source::TestPattern;
pub use crate::transcoder::FeederStats;

//! Process supervision and frame plumbing shared by the server and transcoder sides.
//!
//! * `stream_params`: session geometry and encoding parameters.
//! * `frame_pool`: reusable raw frame buffers.
//! * `environment`: search paths handed to the private binaries.
//! * `launcher`: the seam between supervision and the OS (`std::process`).
//! * `supervisor`: launch → wait → relaunch loop with backoff and graceful stop.
//! * `input_pipe`: synchronized handle to a child's stdin.
//! * `output_monitor`: drains child output into the log.

pub mod environment;
pub mod frame_pool;
pub mod input_pipe;
pub mod launcher;
mod output_monitor;
pub mod stream_params;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

//! Synthetic frame source standing in for a camera.

use crate::core::frame_pool::FramePool;
use crate::core::stream_params::{PixelFormat, StreamParameters};
use crate::error::{Error, Result};
use crate::relay::FrameRelay;
use crossbeam_channel::{select, Sender};
use log::{debug, error, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POOL_CAPACITY: usize = 3;
// Pixels the pattern moves per frame.
const SPEED: u64 = 4;

/// Produces moving-gradient frames at the session frame rate on its own thread.
///
/// Frames come from a [`FramePool`] and go back to it as soon as the sink
/// returns, the way camera preview buffers are recycled.
///
/// # Example
///
/// ```rust,ignore
/// let relay = Arc::new(FrameRelay::new(config));
/// relay.start_session(params.clone())?;
///
/// let mut source = TestPattern::new(params);
/// source.start_relay(relay.clone())?;
/// // ...
/// source.stop();
/// relay.stop_session();
/// ```
pub struct TestPattern {
    params: StreamParameters,
    frames: Arc<AtomicU64>,
    stop_sender: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TestPattern {
    pub fn new(params: StreamParameters) -> Self {
        Self {
            params,
            frames: Arc::new(AtomicU64::new(0)),
            stop_sender: None,
            worker: None,
        }
    }

    /// Starts producing frames into `relay`.
    pub fn start_relay(&mut self, relay: Arc<FrameRelay>) -> Result<()> {
        self.start(move |frame| relay.on_frame_available(frame))
    }

    /// Starts producing frames into `sink`, one call per frame.
    pub fn start<F>(&mut self, mut sink: F) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning("frame-source".to_string()));
        }

        let (stop_sender, stop_receiver) = crossbeam_channel::bounded::<()>(1);
        let interval = Duration::from_secs(1) / self.params.frame_rate().max(1);
        let pool = FramePool::for_params(&self.params, POOL_CAPACITY);
        let (width, height) = (self.params.width(), self.params.height());
        let format = self.params.pixel_format();
        let frames = self.frames.clone();

        let handle = std::thread::Builder::new()
            .name("frame-source".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                let mut index = 0u64;
                loop {
                    select! {
                        recv(stop_receiver) -> _ => break,
                        recv(ticker) -> _ => {
                            let mut frame = pool.acquire();
                            fill_frame(&mut frame[..], width, height, format, index);
                            sink(&frame[..]);
                            index += 1;
                            frames.store(index, Ordering::Release);
                        }
                    }
                }
                debug!("Frame source exiting after {index} frames");
            })
            .map_err(|source| Error::ThreadSpawn {
                name: "frame-source".to_string(),
                source,
            })?;

        info!(
            "Test pattern started: {} {} every {interval:?}",
            self.params.video_size(),
            format
        );
        self.stop_sender = Some(stop_sender);
        self.worker = Some(handle);
        Ok(())
    }

    /// Stops the source thread and waits for it.
    pub fn stop(&mut self) {
        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.try_send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Thread[frame-source] panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }
}

impl Drop for TestPattern {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Draws frame `index` of a diagonal luma gradient scrolling right, over a
/// horizontal/vertical chroma gradient.
///
/// `frame` must hold exactly `width * height * 3 / 2` bytes.
pub fn fill_frame(frame: &mut [u8], width: u32, height: u32, format: PixelFormat, index: u64) {
    let (w, h) = (width as usize, height as usize);
    let (luma, chroma) = frame.split_at_mut(w * h);
    let shift = index.wrapping_mul(SPEED) as usize;

    for (y, row) in luma.chunks_exact_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = (x + y).wrapping_sub(shift) as u8;
        }
    }

    let (cw, ch) = (w / 2, h / 2);
    let u_at = |x: usize| (x * 255 / cw.max(1)) as u8;
    let v_at = |y: usize| (y * 255 / ch.max(1)) as u8;
    match format {
        PixelFormat::Nv21 => {
            // Interleaved V,U pairs.
            for (y, row) in chroma.chunks_exact_mut(cw * 2).enumerate() {
                for (x, pair) in row.chunks_exact_mut(2).enumerate() {
                    pair[0] = v_at(y);
                    pair[1] = u_at(x);
                }
            }
        }
        PixelFormat::Yuv420p => {
            let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);
            for row in u_plane.chunks_exact_mut(cw) {
                for (x, px) in row.iter_mut().enumerate() {
                    *px = u_at(x);
                }
            }
            for (y, row) in v_plane.chunks_exact_mut(cw).enumerate() {
                row.fill(v_at(y));
            }
        }
    }
}

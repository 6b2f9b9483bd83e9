use crate::core::stream_params::StreamParameters;
use crossbeam_channel::{Receiver, Sender};
use std::ops::{Deref, DerefMut};

/// A fixed-size pool of raw frame buffers.
///
/// A frame source takes a [`FrameBuffer`], fills it, lends it to the relay for
/// the duration of one push and drops it; dropping hands the allocation back to
/// the pool, so steady-state capture does not allocate.
#[derive(Clone)]
pub struct FramePool {
    frame_size: usize,
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl FramePool {
    /// Creates a pool holding up to `capacity` buffers of `frame_size` bytes,
    /// all allocated up front.
    pub fn new(frame_size: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        for _ in 0..capacity {
            let _ = sender.try_send(vec![0u8; frame_size]);
        }
        Self {
            frame_size,
            sender,
            receiver,
        }
    }

    /// A pool sized for the frames of `params`.
    pub fn for_params(params: &StreamParameters, capacity: usize) -> Self {
        Self::new(params.frame_size(), capacity)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Buffers currently waiting in the pool.
    pub fn available(&self) -> usize {
        self.receiver.len()
    }

    /// Takes a pooled buffer, allocating a fresh one if the pool ran dry.
    pub fn acquire(&self) -> FrameBuffer {
        self.try_acquire().unwrap_or_else(|| FrameBuffer {
            data: vec![0u8; self.frame_size],
            home: Some(self.sender.clone()),
        })
    }

    /// Takes a pooled buffer without allocating.
    pub fn try_acquire(&self) -> Option<FrameBuffer> {
        let data = self.receiver.try_recv().ok()?;
        Some(FrameBuffer {
            data,
            home: Some(self.sender.clone()),
        })
    }
}

/// One raw frame of `width * height * bits_per_pixel / 8` bytes.
///
/// Contents are left as the previous user wrote them; sources overwrite the
/// whole buffer on every capture.
pub struct FrameBuffer {
    data: Vec<u8>,
    home: Option<Sender<Vec<u8>>>,
}

impl FrameBuffer {
    /// A buffer that does not belong to any pool.
    pub fn detached(frame_size: usize) -> Self {
        Self {
            data: vec![0u8; frame_size],
            home: None,
        }
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for FrameBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            // A full pool means this was an overflow allocation; let it go.
            let _ = home.try_send(std::mem::take(&mut self.data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_return_to_pool() {
        let pool = FramePool::new(16, 2);
        assert_eq!(pool.available(), 2);

        let mut frame = pool.acquire();
        assert_eq!(frame.len(), 16);
        frame[0] = 0xAB;
        assert_eq!(pool.available(), 1);

        drop(frame);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_overflow_allocation_is_bounded() {
        let pool = FramePool::new(8, 1);
        let a = pool.acquire();
        assert!(pool.try_acquire().is_none());
        let b = pool.acquire();
        assert_eq!(b.len(), 8);

        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_pool_for_params() {
        let params = StreamParameters::builder()
            .video_size(640, 480)
            .build()
            .unwrap();
        let pool = FramePool::for_params(&params, 3);
        assert_eq!(pool.frame_size(), 640 * 480 * 12 / 8);
        assert_eq!(pool.acquire().len(), 460_800);
    }
}

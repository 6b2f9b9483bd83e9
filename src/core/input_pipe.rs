use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Write end of a supervised child's stdin, shared between the supervision
/// thread (which installs and releases it) and the single writer pushing data.
///
/// The handle is only present while the child is Running. It is released the
/// moment the child exits so a write can never reach a stale, closed pipe;
/// writers observe "unavailable" instead.
#[derive(Clone, Default)]
pub struct InputPipe {
    inner: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl InputPipe {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Write + Send>>> {
        // A writer that panicked mid-write leaves nothing half-updated in the slot.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn install(&self, writer: Box<dyn Write + Send>) {
        *self.lock() = Some(writer);
    }

    /// Drops the current handle, closing the pipe from this side.
    pub(crate) fn release(&self) {
        let writer = self.lock().take();
        drop(writer);
    }

    /// Like [`release`](Self::release), but gives up if a write is in flight.
    /// Returns whether the handle is gone.
    pub(crate) fn try_release(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
                true
            }
            Err(std::sync::TryLockError::WouldBlock) => false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.lock().is_some()
    }

    /// Writes `buf` in full and flushes.
    ///
    /// Returns `None` without touching anything when no child is Running.
    pub fn write_all(&self, buf: &[u8]) -> Option<io::Result<()>> {
        let mut guard = self.lock();
        let writer = guard.as_mut()?;
        Some(writer.write_all(buf).and_then(|_| writer.flush()))
    }
}

impl std::fmt::Debug for InputPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPipe")
            .field("available", &self.is_available())
            .finish()
    }
}

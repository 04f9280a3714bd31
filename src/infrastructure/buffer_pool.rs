//! Relay Buffer Pool
//!
//! Fixed-size byte buffers shared by every bridge of a listen address.
//! A buffer is checked out when a bridge half is created, travels between
//! the two halves while the bridge lives, and is released on close.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Default size of one relay buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default bound on buffers checked out at once.
pub const DEFAULT_POOL_SIZE: usize = 8192;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("buffer pool exhausted ({0} buffers in use)")]
    Exhausted(usize),
}

/// Fixed-capacity buffer with a fill cursor and a drain cursor.
///
/// Bytes in `[drained, filled)` are pending; reads append at `filled`,
/// writes consume from `drained`.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    filled: usize,
    drained: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            drained: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Free space after the filled region.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Mark `n` bytes of the spare region as filled.
    pub fn advance_filled(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Copy as much of `src` as fits. Returns the number of bytes copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.filled);
        self.data[self.filled..self.filled + n].copy_from_slice(&src[..n]);
        self.filled += n;
        n
    }

    /// Bytes filled but not yet drained.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.drained..self.filled]
    }

    /// Mark `n` pending bytes as drained.
    pub fn consume(&mut self, n: usize) {
        self.drained = (self.drained + n).min(self.filled);
    }

    pub fn has_remaining(&self) -> bool {
        self.drained < self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Reset both cursors. Contents are left in place.
    pub fn clear(&mut self) {
        self.filled = 0;
        self.drained = 0;
    }

    /// Reset cursors and zero the contents.
    pub fn wipe(&mut self) {
        self.data.fill(0);
        self.clear();
    }
}

/// Thread-safe pool of equally sized buffers.
pub struct BufferPool {
    buffer_size: usize,
    limit: usize,
    paranoid: bool,
    idle: Mutex<Vec<Buffer>>,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// `limit` bounds buffers checked out at once and buffers kept idle.
    pub fn new(buffer_size: usize, limit: usize, paranoid: bool) -> Self {
        Self {
            buffer_size,
            limit,
            paranoid,
            idle: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Whether buffers are zeroed on reuse and release.
    pub fn is_paranoid(&self) -> bool {
        self.paranoid
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Take a clean buffer, allocating one if none is idle.
    pub fn checkout(&self) -> Result<Buffer, PoolError> {
        let claimed = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            });
        if let Err(n) = claimed {
            tracing::warn!("buffer pool exhausted: {} in use", n);
            return Err(PoolError::Exhausted(n));
        }

        let buffer = self.idle.lock().pop();
        Ok(buffer.unwrap_or_else(|| Buffer::new(self.buffer_size)))
    }

    /// Give a buffer back. It is cleared, and zeroed in paranoid mode.
    pub fn release(&self, mut buffer: Buffer) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.recycle(&mut buffer);

        let mut idle = self.idle.lock();
        if idle.len() < self.limit && buffer.capacity() == self.buffer_size {
            idle.push(buffer);
        }
    }

    /// Make a drained buffer ready for the next read without returning it.
    pub fn recycle(&self, buffer: &mut Buffer) {
        if self.paranoid {
            buffer.wipe();
        } else {
            buffer.clear();
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE, false)
    }
}

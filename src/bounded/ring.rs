//! Fixed-capacity circular buffer with one writer and N readers.
//!
//! The writer reserves space on every reader's [`BoundedLock`] before
//! copying, so it can never overwrite bytes the slowest live reader has
//! not consumed yet.  Readers release space only on their own lock.
//!
//! Termination is two-staged: [`RingWriter::signal_end`] marks a clean
//! end of stream, [`RingWriter::close`] wakes everybody.  A reader that
//! drains a closed ring reports EOF only if the end was signalled
//! first; otherwise it reports a broken stream.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::lock::BoundedLock;
use crate::errors::{Result, StreamError};
use crate::source::ByteSource;

struct RingShared {
    capacity: usize,
    buffer: Mutex<Vec<u8>>,
    locks: Vec<BoundedLock>,
    end_signalled: AtomicBool,
}

impl RingShared {
    /// Copy `src` into the ring at `pos`, tail then head.
    fn copy_in(&self, pos: usize, src: &[u8]) {
        let mut buffer = self.buffer.lock();
        let tail = (self.capacity - pos).min(src.len());
        buffer[pos..pos + tail].copy_from_slice(&src[..tail]);
        if tail < src.len() {
            buffer[..src.len() - tail].copy_from_slice(&src[tail..]);
        }
    }

    /// Copy `dst.len()` bytes out of the ring starting at `pos`.
    fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let buffer = self.buffer.lock();
        let tail = (self.capacity - pos).min(dst.len());
        dst[..tail].copy_from_slice(&buffer[pos..pos + tail]);
        if tail < dst.len() {
            let head = dst.len() - tail;
            dst[tail..].copy_from_slice(&buffer[..head]);
        }
    }

    fn close_all(&self) {
        for lock in &self.locks {
            lock.close();
        }
    }
}

/// The ring itself.  Hands out its single writer and its readers, each
/// exactly once, so they can move to different threads.
pub struct BoundedRing {
    shared: Arc<RingShared>,
    writer: Option<RingWriter>,
    readers: Vec<Option<RingReader>>,
}

impl BoundedRing {
    /// Allocate a ring of `capacity` bytes shared by `reader_count` readers.
    pub fn new(capacity: usize, reader_count: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(StreamError::invalid("ring capacity must be positive"));
        }
        if reader_count == 0 {
            return Err(StreamError::invalid("a ring needs at least one reader"));
        }
        let shared = Arc::new(RingShared {
            capacity,
            buffer: Mutex::new(vec![0u8; capacity]),
            locks: (0..reader_count).map(|_| BoundedLock::new(capacity)).collect(),
            end_signalled: AtomicBool::new(false),
        });
        let writer = RingWriter {
            shared: shared.clone(),
            write_pos: 0,
            closed: false,
        };
        let readers = (0..reader_count)
            .map(|index| {
                Some(RingReader {
                    shared: shared.clone(),
                    index,
                    read_pos: 0,
                    closed: false,
                })
            })
            .collect();
        Ok(Self {
            shared,
            writer: Some(writer),
            readers,
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Take the writer.  Fails if it was already taken.
    pub fn writer(&mut self) -> Result<RingWriter> {
        self.writer
            .take()
            .ok_or_else(|| StreamError::invalid("ring writer already taken"))
    }

    /// Take reader `index`.  Fails if out of range or already taken.
    pub fn reader(&mut self, index: usize) -> Result<RingReader> {
        let count = self.readers.len();
        let slot = self.readers.get_mut(index).ok_or_else(|| {
            StreamError::invalid(format!("reader index {index} out of range 0..{count}"))
        })?;
        slot.take()
            .ok_or_else(|| StreamError::invalid(format!("reader {index} already taken")))
    }

    /// Close every lock.  Readers still draining see a broken stream
    /// unless the writer signalled the end.
    pub fn close(&self) {
        self.shared.close_all();
    }
}

/// The single producing handle.
pub struct RingWriter {
    shared: Arc<RingShared>,
    write_pos: usize,
    closed: bool,
}

impl RingWriter {
    /// Broadcast `src` to every open reader.
    ///
    /// Blocks until the slowest open reader has room.  Fails with a
    /// broken-stream error when no reader is left to consume it.
    pub fn write_all_readers(&mut self, src: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StreamError::closed("cannot write to a closed ring"));
        }
        let capacity = self.shared.capacity;
        if src.len() > capacity {
            return Err(StreamError::invalid(format!(
                "write of {} bytes exceeds ring capacity {capacity}",
                src.len()
            )));
        }
        if src.is_empty() {
            return Ok(());
        }

        let mut alive = false;
        for lock in &self.shared.locks {
            if lock.reserve_for_write(src.len()) {
                alive = true;
            }
        }
        if !alive {
            return Err(StreamError::broken("no more active readers"));
        }

        self.shared.copy_in(self.write_pos, src);
        self.write_pos = (self.write_pos + src.len()) % capacity;

        for lock in &self.shared.locks {
            lock.release_for_read(src.len());
        }
        Ok(())
    }

    /// Mark a clean end of stream.  Readers see EOF once they drain.
    pub fn signal_end(&self) {
        self.shared.end_signalled.store(true, Ordering::SeqCst);
    }

    /// Close every reader lock.  Idempotent; also run on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(
            "Ring writer closed (end signalled: {})",
            self.shared.end_signalled.load(Ordering::SeqCst)
        );
        self.shared.close_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Write for RingWriter {
    /// Writes at most one ring capacity per call.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.shared.capacity);
        self.write_all_readers(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// One consuming branch with its own cursor and flow control.
pub struct RingReader {
    shared: Arc<RingShared>,
    index: usize,
    read_pos: usize,
    closed: bool,
}

impl RingReader {
    pub fn index(&self) -> usize {
        self.index
    }

    fn lock(&self) -> &BoundedLock {
        &self.shared.locks[self.index]
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop this branch.  Other readers and the writer carry on.
    pub fn close_reader(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.lock().close();
    }
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(StreamError::closed(format!("ring reader {} is closed", self.index)).into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let granted = self.lock().reserve_for_read(buf.len());
        if granted == 0 {
            if self.shared.end_signalled.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(StreamError::broken("ring closed before end of stream").into());
        }
        self.shared.copy_out(self.read_pos, &mut buf[..granted]);
        self.read_pos = (self.read_pos + granted) % self.shared.capacity;
        self.lock().release_for_write(granted);
        Ok(granted)
    }
}

impl ByteSource for RingReader {
    fn available(&mut self) -> io::Result<usize> {
        Ok(self.lock().peek_available())
    }

    fn close(&mut self) -> io::Result<()> {
        self.close_reader();
        Ok(())
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.close_reader();
    }
}

//! Fake sources shared by the unit tests.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::source::{ByteSource, CloseHandle};

/// Deterministic payload of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

/// Random payload of `len` bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Serves `data` in slices of at most `max_read`, optionally failing
/// once `fail_at` bytes were delivered or sleeping `stall` before the
/// read that crosses `stall_at`.  A stall ends early when the source is
/// closed through its close handle.
pub struct FakeSource {
    data: Vec<u8>,
    pos: usize,
    max_read: usize,
    fail_at: Option<usize>,
    stall: Option<(usize, Duration)>,
    hide_available: bool,
    closed: Arc<AtomicBool>,
}

impl FakeSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            max_read: usize::MAX,
            fail_at: None,
            stall: None,
            hide_available: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read.max(1);
        self
    }

    pub fn fail_at(mut self, offset: usize) -> Self {
        self.fail_at = Some(offset);
        self
    }

    pub fn stall_at(mut self, offset: usize, pause: Duration) -> Self {
        self.stall = Some((offset, pause));
        self
    }

    /// Report `available() == 0` like a socket would.
    pub fn hide_available(mut self) -> Self {
        self.hide_available = true;
        self
    }

    /// Flag flipped when the source is closed.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl Read for FakeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "fake source closed"));
        }
        if let Some(offset) = self.fail_at {
            if self.pos >= offset {
                return Err(io::Error::new(io::ErrorKind::Other, "injected failure"));
            }
        }
        if let Some((offset, pause)) = self.stall {
            if self.pos >= offset {
                self.stall = None;
                let deadline = Instant::now() + pause;
                while Instant::now() < deadline && !self.closed.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                if self.closed.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "fake source closed"));
                }
            }
        }
        let mut n = buf.len().min(self.max_read).min(self.data.len() - self.pos);
        if let Some(offset) = self.fail_at {
            n = n.min(offset - self.pos);
        }
        if let Some((offset, _)) = self.stall {
            if offset > self.pos {
                n = n.min(offset - self.pos);
            }
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl ByteSource for FakeSource {
    fn available(&mut self) -> io::Result<usize> {
        if self.hide_available {
            return Ok(0);
        }
        Ok(self.data.len() - self.pos)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        let closed = self.closed.clone();
        Some(Arc::new(move || {
            closed.store(true, Ordering::SeqCst);
            Ok(())
        }))
    }
}

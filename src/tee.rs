//! Fan one source stream out to N independently paced readers.
//!
//! A single background thread copies the source into a
//! [`BoundedRing`] sized at a multiple of the standard buffer.  Source
//! and ring failures land in an [`ErrorSlot`]; each [`TeeReader`]
//! replays that root cause when its branch breaks, and
//! [`TeeSplitter::check_error`] exposes it after the fact.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use metrics::counter;
use tracing::{debug, error};

use crate::bounded::{BoundedRing, RingReader, RingWriter};
use crate::config::StreamConfig;
use crate::errors::{is_broken_stream, ErrorSlot, Result, StreamError};
use crate::metrics::{BACKGROUND_ERRORS_TOTAL, TEE_BYTES_TOTAL};
use crate::source::{ByteSource, CloseHandle};

pub struct TeeSplitter {
    ring: BoundedRing,
    errors: ErrorSlot,
    copier: Option<JoinHandle<()>>,
    source_close: Option<CloseHandle>,
    closing: Arc<AtomicBool>,
}

impl TeeSplitter {
    /// Start copying `source` into a ring shared by `readers` branches.
    pub fn new<S>(source: S, readers: usize, config: &StreamConfig) -> Result<Self>
    where
        S: ByteSource + 'static,
    {
        let buffer_size = config.buffer_size;
        if buffer_size == 0 {
            return Err(StreamError::invalid("buffer size must be positive"));
        }
        let mut ring = BoundedRing::new(config.tee_capacity(), readers)?;
        let writer = ring.writer()?;
        let errors = ErrorSlot::new();
        let closing = Arc::new(AtomicBool::new(false));
        let source_close = source.close_handle();

        let slot = errors.clone();
        let stop = closing.clone();
        let copier = thread::Builder::new()
            .name("fanstore-tee".to_string())
            .spawn(move || copy_into_ring(source, writer, buffer_size, slot, stop))?;

        debug!(
            "Tee started: readers={} capacity={}",
            readers,
            ring.capacity()
        );
        Ok(Self {
            ring,
            errors,
            copier: Some(copier),
            source_close,
            closing,
        })
    }

    pub fn reader_count(&self) -> usize {
        self.ring.reader_count()
    }

    /// Take branch `index`.  Each branch can be taken once.
    pub fn reader(&mut self, index: usize) -> Result<TeeReader> {
        let inner = self.ring.reader(index)?;
        Ok(TeeReader {
            inner,
            errors: self.errors.clone(),
        })
    }

    /// Surface a failure recorded by the copy thread.
    pub fn check_error(&self) -> io::Result<()> {
        self.errors.check()
    }

    /// Close the ring and the source.  A copy thread blocked in a source
    /// read is woken when the source offers a close handle; otherwise it
    /// stops at its next ring write and closes the source on its way out.
    pub fn close(&mut self) -> io::Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.ring.close();
        if let Some(close_source) = self.source_close.take() {
            if let Err(e) = close_source() {
                debug!("Closing tee source failed: {}", e);
            }
        }
        if let Some(copier) = self.copier.take() {
            if copier.is_finished() {
                self.reap(copier);
            } else {
                self.copier = Some(copier);
            }
        }
        self.check_error()
    }

    /// Wait for the copy thread to finish and report its outcome.
    /// Blocks until every branch drained or closed.
    pub fn join(mut self) -> io::Result<()> {
        if let Some(copier) = self.copier.take() {
            self.reap(copier);
        }
        self.check_error()
    }

    fn reap(&self, copier: JoinHandle<()>) {
        if copier.join().is_err() {
            self.errors
                .record_stream(StreamError::broken("tee copy thread panicked"));
        }
    }
}

impl Drop for TeeSplitter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn copy_into_ring<S: ByteSource>(
    mut source: S,
    mut writer: RingWriter,
    buffer_size: usize,
    errors: ErrorSlot,
    closing: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    let outcome: io::Result<()> = loop {
        let n = match source.read(&mut buf) {
            // A source closed under us must not look like a clean end.
            Ok(0) if closing.load(Ordering::SeqCst) => {
                break Err(StreamError::closed("tee closed").into());
            }
            Ok(0) => {
                writer.signal_end();
                break Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all_readers(&buf[..n]) {
            break Err(e.into());
        }
        total += n as u64;
        counter!(TEE_BYTES_TOTAL).increment(n as u64);
    };

    match outcome {
        Ok(()) => debug!("Tee copy finished: bytes={}", total),
        Err(e) if closing.load(Ordering::SeqCst) => {
            debug!("Tee copy stopped by close after {} bytes: {}", total, e);
        }
        Err(e) => {
            error!("Tee copy failed after {} bytes: {}", total, e);
            counter!(BACKGROUND_ERRORS_TOTAL, "task" => "tee").increment(1);
            errors.record(&e);
        }
    }
    writer.close();
    if let Err(e) = source.close() {
        errors.record(&e);
    }
}

/// One public branch of a tee.
pub struct TeeReader {
    inner: RingReader,
    errors: ErrorSlot,
}

impl TeeReader {
    pub fn index(&self) -> usize {
        self.inner.index()
    }
}

impl Read for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            // The ring only says the producer died; the slot knows why.
            Err(e) if is_broken_stream(&e) => Err(self.errors.error().unwrap_or(e)),
            other => other,
        }
    }
}

impl ByteSource for TeeReader {
    fn available(&mut self) -> io::Result<usize> {
        self.inner.available()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close_reader();
        Ok(())
    }
}

//! Bounded in-process byte pipe between a producer thread and a
//! consumer thread.
//!
//! The writer coalesces small writes into buffers of the configured
//! size and hands them over a bounded channel, so at most `depth`
//! buffers are ever in flight.  Both sides wait in short slices and
//! give up as soon as the shared [`ErrorSlot`] holds an error, which is
//! how a recorded timeout or producer failure unblocks a peer.
//!
//! The writer must call [`PipeWriter::finish`] for the reader to see a
//! clean end of stream; dropping it unfinished is a broken stream.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::errors::{ErrorSlot, StreamError};
use crate::source::ByteSource;

/// How long either side waits before re-checking the error slot.
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct PipeState {
    finished: AtomicBool,
    reader_closed: AtomicBool,
}

/// Create a pipe holding at most `depth` buffers of `buffer_size` bytes.
pub fn pipe(depth: usize, buffer_size: usize, errors: ErrorSlot) -> (PipeWriter, PipeReader) {
    let (tx, rx) = channel::bounded(depth.max(1));
    let state = Arc::new(PipeState::default());
    let writer = PipeWriter {
        tx: Some(tx),
        pending: BytesMut::with_capacity(buffer_size),
        buffer_size: buffer_size.max(1),
        state: state.clone(),
        errors: errors.clone(),
    };
    let reader = PipeReader {
        rx: Some(rx),
        current: Bytes::new(),
        state,
        errors,
    };
    (writer, reader)
}

pub struct PipeWriter {
    tx: Option<Sender<Bytes>>,
    pending: BytesMut,
    buffer_size: usize,
    state: Arc<PipeState>,
    errors: ErrorSlot,
}

impl PipeWriter {
    fn send(&mut self, mut chunk: Bytes) -> io::Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(StreamError::closed("pipe writer already finished").into());
        };
        loop {
            self.errors.check()?;
            if self.state.reader_closed.load(Ordering::SeqCst) {
                return Err(StreamError::broken("pipe reader closed").into());
            }
            match tx.send_timeout(chunk, POLL_SLICE) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => chunk = back,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(StreamError::broken("pipe reader closed").into())
                }
            }
        }
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        self.send(chunk)
    }

    /// Flush and mark a clean end of stream.  Idempotent.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.tx.is_none() {
            return Ok(());
        }
        self.flush_pending()?;
        self.state.finished.store(true, Ordering::SeqCst);
        self.tx = None;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_none() {
            return Err(StreamError::closed("pipe writer already finished").into());
        }
        let room = self.buffer_size - self.pending.len();
        let n = buf.len().min(room);
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() >= self.buffer_size {
            self.flush_pending()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()
    }
}

pub struct PipeReader {
    rx: Option<Receiver<Bytes>>,
    current: Bytes,
    state: Arc<PipeState>,
    errors: ErrorSlot,
}

impl PipeReader {
    /// Shared slot this pipe watches.
    pub fn errors(&self) -> &ErrorSlot {
        &self.errors
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            let Some(rx) = self.rx.as_ref() else {
                return Err(StreamError::closed("pipe reader closed").into());
            };
            match rx.recv_timeout(POLL_SLICE) {
                Ok(chunk) => self.current = chunk,
                Err(RecvTimeoutError::Timeout) => self.errors.check()?,
                Err(RecvTimeoutError::Disconnected) => {
                    self.errors.check()?;
                    if self.state.finished.load(Ordering::SeqCst) {
                        return Ok(0);
                    }
                    return Err(StreamError::broken("pipe writer went away").into());
                }
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

impl ByteSource for PipeReader {
    fn available(&mut self) -> io::Result<usize> {
        Ok(self.current.len())
    }

    /// Stop consuming.  A blocked or later writer fails with a broken
    /// stream.
    fn close(&mut self) -> io::Result<()> {
        self.state.reader_closed.store(true, Ordering::SeqCst);
        self.rx = None;
        self.current = Bytes::new();
        Ok(())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.state.reader_closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{is_broken_stream, is_timeout};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_transfer_and_clean_end() {
        let (mut writer, mut reader) = pipe(2, 16, ErrorSlot::new());
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let expected = data.clone();
        let producer = thread::spawn(move || {
            for piece in data.chunks(7) {
                writer.write_all(piece).unwrap();
            }
            writer.finish().unwrap();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_unfinished_writer_is_broken() {
        let (mut writer, mut reader) = pipe(2, 4, ErrorSlot::new());
        writer.write_all(b"abcd").unwrap();
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert!(is_broken_stream(&reader.read(&mut buf).unwrap_err()));
    }

    #[test]
    fn test_closed_reader_fails_writer() {
        let (mut writer, mut reader) = pipe(1, 4, ErrorSlot::new());
        ByteSource::close(&mut reader).unwrap();
        let err = writer.write_all(b"abcdefgh").unwrap_err();
        assert!(is_broken_stream(&err));
        assert!(reader.is_closed());
    }

    #[test]
    fn test_recorded_error_unblocks_reader() {
        let errors = ErrorSlot::new();
        let (_writer, mut reader) = pipe(1, 4, errors.clone());
        let started = Instant::now();
        let blocked = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(80));
        errors.record_stream(StreamError::timeout("nobody wrote"));
        let err = blocked.join().unwrap().unwrap_err();
        assert!(is_timeout(&err));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_recorded_error_unblocks_writer() {
        let errors = ErrorSlot::new();
        let (mut writer, _reader) = pipe(1, 4, errors.clone());
        let blocked = thread::spawn(move || {
            // Second buffer cannot fit: depth is one and nobody reads.
            writer.write_all(b"aaaabbbbcccc")
        });
        thread::sleep(Duration::from_millis(80));
        errors.record_stream(StreamError::timeout("nobody read"));
        assert!(is_timeout(&blocked.join().unwrap().unwrap_err()));
    }

    #[test]
    fn test_finish_flushes_partial_buffer() {
        let (mut writer, mut reader) = pipe(4, 1024, ErrorSlot::new());
        writer.write_all(b"hi").unwrap();
        assert_eq!(reader.available().unwrap(), 0);
        writer.finish().unwrap();
        writer.finish().unwrap();
        assert!(writer.is_finished());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hi");
    }
}

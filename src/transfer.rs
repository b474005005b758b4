//! Background copy of a source into a pipe.
//!
//! [`TransferSource`] runs one thread that feeds a source through a
//! write-side transform into a [`pipe`] and exposes the pipe's read
//! side as an ordinary [`ByteSource`].  The transform is where codecs
//! plug in: passthrough, zstd compression, or any cipher that wraps a
//! `Write`.  A failing transform records its error in the shared slot
//! and drops the pipe unfinished, so a blocked reader wakes with that
//! error instead of hanging.

use std::io::{self, Read};
use std::thread::{self, JoinHandle};

use metrics::counter;
use tracing::{debug, error};

use crate::errors::{ErrorSlot, StreamError};
use crate::metrics::BACKGROUND_ERRORS_TOTAL;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::source::ByteSource;

/// Pipe geometry for a transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub buffer_size: usize,
    pub pipe_depth: usize,
}

impl From<&crate::config::StreamConfig> for TransferOptions {
    fn from(config: &crate::config::StreamConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            pipe_depth: config.pipe_depth,
        }
    }
}

pub struct TransferSource {
    reader: PipeReader,
    errors: ErrorSlot,
    task: Option<JoinHandle<()>>,
    name: &'static str,
}

impl TransferSource {
    /// Spawn `transform(source, sink)` on a background thread.
    ///
    /// The transform returns the number of source bytes it consumed.
    /// On success the pipe is finished; on failure the error is
    /// recorded.  The source is closed either way.
    pub fn spawn<S, F>(
        name: &'static str,
        source: S,
        options: TransferOptions,
        errors: ErrorSlot,
        transform: F,
    ) -> io::Result<Self>
    where
        S: ByteSource + 'static,
        F: FnOnce(&mut S, &mut PipeWriter) -> io::Result<u64> + Send + 'static,
    {
        let (writer, reader) = pipe(options.pipe_depth, options.buffer_size, errors.clone());
        let slot = errors.clone();
        let task = thread::Builder::new()
            .name(format!("fanstore-{name}"))
            .spawn(move || run_transfer(name, source, writer, slot, transform))?;
        Ok(Self {
            reader,
            errors,
            task: Some(task),
            name,
        })
    }

    /// Copy `source` into the pipe unchanged.
    pub fn passthrough<S>(source: S, options: TransferOptions, errors: ErrorSlot) -> io::Result<Self>
    where
        S: ByteSource + 'static,
    {
        Self::spawn("transfer", source, options, errors, |source, sink| {
            let copied = source.transfer_to(sink)?;
            Ok(copied)
        })
    }

    /// Surface a failure recorded by the background thread.
    pub fn check_error(&self) -> io::Result<()> {
        self.errors.check()
    }

    /// Wait for the background thread.  Only safe once the pipe was
    /// drained or closed, otherwise the thread may still be blocked on it.
    pub fn join(&mut self) -> io::Result<()> {
        if let Some(task) = self.task.take() {
            self.reap(task);
        }
        self.check_error()
    }

    fn reap(&self, task: JoinHandle<()>) {
        if task.join().is_err() {
            self.errors
                .record_stream(StreamError::broken(format!("{} task panicked", self.name)));
        }
    }
}

fn run_transfer<S, F>(
    name: &'static str,
    mut source: S,
    mut writer: PipeWriter,
    errors: ErrorSlot,
    transform: F,
) where
    S: ByteSource,
    F: FnOnce(&mut S, &mut PipeWriter) -> io::Result<u64>,
{
    let outcome = transform(&mut source, &mut writer).and_then(|copied| {
        writer.finish()?;
        Ok(copied)
    });
    match outcome {
        Ok(copied) => debug!("Background {} finished: source_bytes={}", name, copied),
        Err(e) => {
            error!("Background {} failed: {}", name, e);
            counter!(BACKGROUND_ERRORS_TOTAL, "task" => name).increment(1);
            errors.record(&e);
        }
    }
    drop(writer);
    if let Err(e) = source.close() {
        errors.record(&e);
    }
}

impl Read for TransferSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.errors.check()?;
        self.reader.read(buf)
    }
}

impl ByteSource for TransferSource {
    fn available(&mut self) -> io::Result<usize> {
        self.errors.check()?;
        self.reader.available()
    }

    /// Close the read side.  The background thread stops at its next
    /// write; it is joined when already done.
    fn close(&mut self) -> io::Result<()> {
        ByteSource::close(&mut self.reader)?;
        if let Some(task) = self.task.take() {
            if task.is_finished() {
                self.reap(task);
            } else {
                self.task = Some(task);
            }
        }
        Ok(())
    }
}

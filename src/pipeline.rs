//! Composable read pipeline: digest, zstd codec, stall watchdog, and a
//! completion signal for a thread waiting on an asynchronous consumer.
//!
//! Stages are attached before the first read; the chain is assembled
//! lazily on first use:
//!
//! ```text
//! source -> [background pipe] -> counter -> [compress | decompress] -> digest
//! ```
//!
//! The digest always covers the bytes the pipeline hands out, so
//! attaching `compress` digests compressed bytes and attaching
//! `decompress` digests decompressed bytes.
//!
//! Any failure is recorded once in a shared [`ErrorSlot`] and replayed
//! on every later call.  Background stages share that slot, so a
//! timeout recorded by [`PipelineHandle::wait_for_all_read`] also
//! unblocks a reader waiting on a pipe.

use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::codec::{self, ZstdDecoder};
use crate::config::{Config, StreamConfig};
use crate::digest::{to_base32, to_base64, to_hex, DigestAlgorithm, Digester};
use crate::errors::{ErrorSlot, Result, StreamError};
use crate::metrics::{PIPELINE_BYTES_TOTAL, STALL_TIMEOUTS_TOTAL};
use crate::source::ByteSource;
use crate::transfer::{TransferOptions, TransferSource};

/// Shape of the raw reads pulled from the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub reads: u64,
    pub bytes: u64,
    pub min_read: usize,
    pub max_read: usize,
}

impl ReadStats {
    fn record(&mut self, n: usize) {
        if self.reads == 0 || n < self.min_read {
            self.min_read = n;
        }
        self.max_read = self.max_read.max(n);
        self.reads += 1;
        self.bytes += n as u64;
    }
}

impl fmt::Display for ReadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads={} bytes={} min={} max={}",
            self.reads, self.bytes, self.min_read, self.max_read
        )
    }
}

struct PipelineShared {
    errors: ErrorSlot,
    total: AtomicU64,
    stats: Mutex<ReadStats>,
    done: Mutex<bool>,
    done_signal: Condvar,
    wait_poll: Duration,
}

impl PipelineShared {
    /// Fire the completion latch.  Only the first call has an effect.
    fn complete(&self) {
        let mut done = self.done.lock();
        if !*done {
            *done = true;
            self.done_signal.notify_all();
        }
    }
}

/// Cloneable view of a pipeline for threads other than the reader.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<PipelineShared>,
}

impl PipelineHandle {
    /// Block until the pipeline is fully read or closed.
    ///
    /// Returns the number of bytes handed out, or `-1` when `timeout`
    /// elapsed first or an error was recorded.  A timeout is itself
    /// recorded, so the reader fails on its next call and any pipe it
    /// is blocked on gives up.
    pub fn wait_for_all_read(&self, timeout: Duration) -> i64 {
        let deadline = Instant::now() + timeout;
        let mut done = self.shared.done.lock();
        loop {
            if self.shared.errors.is_set() {
                return -1;
            }
            if *done {
                return self.shared.total.load(Ordering::SeqCst) as i64;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = self.shared.wait_poll.min(deadline - now);
            self.shared.done_signal.wait_for(&mut done, slice);
        }
        drop(done);

        warn!(
            "Pipeline not drained within {} ms (read so far: {})",
            timeout.as_millis(),
            self.total_read()
        );
        counter!(STALL_TIMEOUTS_TOTAL, "origin" => "drain").increment(1);
        self.shared.errors.record_stream(StreamError::timeout(format!(
            "stream not fully read within {} ms",
            timeout.as_millis()
        )));
        -1
    }

    pub fn total_read(&self) -> u64 {
        self.shared.total.load(Ordering::SeqCst)
    }

    pub fn check_error(&self) -> io::Result<()> {
        self.shared.errors.check()
    }
}

/// Counts raw bytes entering the chain.
struct CountingSource {
    inner: Box<dyn ByteSource>,
    shared: Arc<PipelineShared>,
}

impl Read for CountingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.shared.stats.lock().record(n);
        }
        Ok(n)
    }
}

impl ByteSource for CountingSource {
    fn available(&mut self) -> io::Result<usize> {
        self.inner.available()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Identity,
    Compress(i32),
    Decompress,
}

pub struct ActionPipeline {
    source: Option<Box<dyn ByteSource>>,
    chain: Option<Box<dyn ByteSource>>,
    codec: Codec,
    piped: bool,
    digest: Option<Digester>,
    digest_value: Option<Vec<u8>>,
    shared: Arc<PipelineShared>,
    options: TransferOptions,
    max_wait: Duration,
    default_level: i32,
    last_progress: Instant,
    stall_is_error: bool,
    closed: bool,
}

impl ActionPipeline {
    pub fn new<S>(source: S, config: &StreamConfig) -> Self
    where
        S: ByteSource + 'static,
    {
        Self {
            source: Some(Box::new(source)),
            chain: None,
            codec: Codec::Identity,
            piped: false,
            digest: None,
            digest_value: None,
            shared: Arc::new(PipelineShared {
                errors: ErrorSlot::new(),
                total: AtomicU64::new(0),
                stats: Mutex::new(ReadStats::default()),
                done: Mutex::new(false),
                done_signal: Condvar::new(),
                wait_poll: config.wait_poll(),
            }),
            options: TransferOptions::from(config),
            max_wait: config.max_wait(),
            default_level: 0,
            last_progress: Instant::now(),
            stall_is_error: true,
            closed: false,
        }
    }

    /// Build from the full configuration: stream settings, the default
    /// compression level, and the default digest when enabled.
    pub fn from_config<S>(source: S, config: &Config) -> Self
    where
        S: ByteSource + 'static,
    {
        let mut pipeline = Self::new(source, &config.stream);
        pipeline.default_level = config.compression.level;
        if config.digest.enabled {
            pipeline.digest = Some(config.digest.algorithm.digester());
        }
        pipeline
    }

    fn ensure_configurable(&self, stage: &str) -> Result<()> {
        if self.closed || self.chain.is_some() {
            return Err(StreamError::invalid(format!(
                "{stage} must be attached before the first read"
            )));
        }
        Ok(())
    }

    /// Digest every byte handed out with `algorithm`.
    pub fn compute_digest(&mut self, algorithm: DigestAlgorithm) -> Result<()> {
        self.ensure_configurable("digest")?;
        self.digest = Some(algorithm.digester());
        Ok(())
    }

    /// Hand out the zstd-compressed source at the configured level.
    pub fn compress(&mut self) -> Result<()> {
        self.compress_with_level(self.default_level)
    }

    pub fn compress_with_level(&mut self, level: i32) -> Result<()> {
        self.ensure_configurable("compression")?;
        if self.codec == Codec::Decompress {
            return Err(StreamError::invalid(
                "compression and decompression are mutually exclusive",
            ));
        }
        self.codec = Codec::Compress(level);
        Ok(())
    }

    /// Hand out the zstd-decompressed source.
    pub fn decompress(&mut self) -> Result<()> {
        self.ensure_configurable("decompression")?;
        if matches!(self.codec, Codec::Compress(_)) {
            return Err(StreamError::invalid(
                "compression and decompression are mutually exclusive",
            ));
        }
        self.codec = Codec::Decompress;
        Ok(())
    }

    /// Read the source on a background thread through a pipe.
    pub fn async_piped_transfer(&mut self) -> Result<()> {
        self.ensure_configurable("piped transfer")?;
        self.piped = true;
        Ok(())
    }

    /// Keep logging stalls but stop failing the stream on them.
    pub fn set_stall_is_error(&mut self, stall_is_error: bool) {
        self.stall_is_error = stall_is_error;
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: self.shared.clone(),
        }
    }

    /// See [`PipelineHandle::wait_for_all_read`].
    pub fn wait_for_all_read(&self, timeout: Duration) -> i64 {
        self.handle().wait_for_all_read(timeout)
    }

    /// Bytes handed out so far.
    pub fn total_read(&self) -> u64 {
        self.shared.total.load(Ordering::SeqCst)
    }

    /// Raw bytes pulled from the source so far.
    pub fn source_read(&self) -> u64 {
        self.shared.stats.lock().bytes
    }

    pub fn read_stats(&self) -> ReadStats {
        *self.shared.stats.lock()
    }

    pub fn check_error(&self) -> io::Result<()> {
        self.shared.errors.check()
    }

    fn chain(&mut self) -> io::Result<&mut Box<dyn ByteSource>> {
        if self.chain.is_none() {
            let chain = self.build_chain()?;
            self.chain = Some(chain);
        }
        match self.chain.as_mut() {
            Some(chain) => Ok(chain),
            None => Err(StreamError::closed("pipeline source released").into()),
        }
    }

    fn build_chain(&mut self) -> io::Result<Box<dyn ByteSource>> {
        let raw = self
            .source
            .take()
            .ok_or_else(|| StreamError::closed("pipeline source released"))?;
        let errors = self.shared.errors.clone();
        let raw: Box<dyn ByteSource> = if self.piped {
            Box::new(TransferSource::passthrough(raw, self.options, errors.clone())?)
        } else {
            raw
        };
        let counted = CountingSource {
            inner: raw,
            shared: self.shared.clone(),
        };
        let chain: Box<dyn ByteSource> = match self.codec {
            Codec::Identity => Box::new(counted),
            Codec::Compress(level) => {
                Box::new(codec::compress(counted, level, self.options, errors)?)
            }
            Codec::Decompress => Box::new(ZstdDecoder::new(counted)?),
        };
        debug!(
            "Pipeline chain built: codec={:?} piped={} digest={:?}",
            self.codec,
            self.piped,
            self.digest.as_ref().map(Digester::algorithm)
        );
        Ok(chain)
    }

    /// Close the active chain off the calling thread; a blocked or slow
    /// close must not hold up the caller.
    fn abort_chain(&mut self) {
        let Some(mut chain) = self.chain.take() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("fanstore-abort".to_string())
            .spawn(move || {
                if let Err(e) = chain.close() {
                    debug!("Closing aborted pipeline chain failed: {}", e);
                }
            });
        if let Err(e) = spawned {
            warn!("Could not spawn pipeline abort thread: {}", e);
        }
    }

    /// Record `err` (first error wins) and return the error to surface.
    fn fail(&mut self, err: io::Error) -> io::Error {
        self.shared.errors.record(&err);
        self.shared.errors.error().unwrap_or(err)
    }

    fn check(&mut self) -> io::Result<()> {
        if let Err(e) = self.shared.errors.check() {
            self.abort_chain();
            self.shared.complete();
            return Err(e);
        }
        if self.closed {
            return Err(StreamError::closed("pipeline closed").into());
        }
        Ok(())
    }

    /// Account for a read that returned `n` bytes.  Only the time spent
    /// inside the read call counts towards a stall, never the consumer's
    /// own time between reads.
    fn progress(&mut self, n: usize) {
        if n > 0 {
            self.shared.total.fetch_add(n as u64, Ordering::SeqCst);
            counter!(PIPELINE_BYTES_TOTAL).increment(n as u64);
        }
        let gap = self.last_progress.elapsed();
        if gap > self.max_wait {
            self.on_stall(gap);
        }
        if n == 0 {
            self.finalize_digest();
            self.shared.complete();
        }
    }

    fn on_stall(&mut self, gap: Duration) {
        counter!(STALL_TIMEOUTS_TOTAL, "origin" => "read").increment(1);
        if !self.stall_is_error {
            warn!(
                "Pipeline stalled {} ms (max {} ms), tolerated",
                gap.as_millis(),
                self.max_wait.as_millis()
            );
            return;
        }
        warn!(
            "Pipeline stalled {} ms (max {} ms), closing source",
            gap.as_millis(),
            self.max_wait.as_millis()
        );
        self.shared.errors.record_stream(StreamError::timeout(format!(
            "read stalled for {} ms",
            gap.as_millis()
        )));
        self.abort_chain();
        self.shared.complete();
    }

    fn finalize_digest(&mut self) {
        if self.digest_value.is_none() {
            if let Some(digester) = self.digest.take() {
                self.digest_value = Some(digester.finalize());
            }
        }
    }

    /// Raw digest.  Finalized on first call; later calls return the
    /// same value.  Meaningful once the stream was consumed or closed.
    pub fn digest_value(&mut self) -> Option<Vec<u8>> {
        self.finalize_digest();
        self.digest_value.clone()
    }

    pub fn digest_hex(&mut self) -> Option<String> {
        self.digest_value().map(|raw| to_hex(&raw))
    }

    pub fn digest_base64(&mut self) -> Option<String> {
        self.digest_value().map(|raw| to_base64(&raw))
    }

    pub fn digest_base32(&mut self) -> Option<String> {
        self.digest_value().map(|raw| to_base32(&raw))
    }

    /// Default textual digest (base32).
    pub fn digest(&mut self) -> Option<String> {
        self.digest_base32()
    }
}

impl Read for ActionPipeline {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.last_progress = Instant::now();
        let result = match self.chain() {
            Ok(chain) => chain.read(buf),
            Err(e) => Err(e),
        };
        let n = match result {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => return Err(self.fail(e)),
        };
        if let Some(digester) = self.digest.as_mut() {
            digester.update(&buf[..n]);
        }
        self.progress(n);
        Ok(n)
    }
}

impl ByteSource for ActionPipeline {
    fn available(&mut self) -> io::Result<usize> {
        self.check()?;
        self.last_progress = Instant::now();
        let result = match self.chain() {
            Ok(chain) => chain.available(),
            Err(e) => Err(e),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Close every owned stage, finalize the digest, and fire the
    /// completion latch.  Returns the first recorded error, if any.
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return self.shared.errors.check();
        }
        self.closed = true;
        let mut first = None;
        if let Some(mut chain) = self.chain.take() {
            if let Err(e) = chain.close() {
                first.get_or_insert(e);
            }
        }
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                first.get_or_insert(e);
            }
        }
        self.finalize_digest();
        self.shared.complete();
        if let Some(e) = first {
            self.shared.errors.record(&e);
        }
        self.shared.errors.check()
    }
}

impl Drop for ActionPipeline {
    fn drop(&mut self) {
        let _ = ByteSource::close(self);
    }
}

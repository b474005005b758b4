//! Carve one source stream into a sequence of bounded chunk windows.
//!
//! Every chunker follows the same cycle: call
//! [`ChunkSource::next_chunk`], consume the window through the usual
//! [`ByteSource`] operations until they report end of chunk, repeat
//! until `next_chunk` returns `false`.  Reads never cross a window
//! boundary.  Closing a chunker through [`ByteSource::close`] only
//! marks the current window consumed; the source itself is closed on
//! natural exhaustion or through [`ChunkSource::close_source`].
//!
//! Three buffering policies are available:
//!
//! * [`BufferedChunker`] reads a whole window into memory up front, so
//!   its size is exact before the first byte is consumed.
//! * [`DirectChunker`] reads straight from the source inside the
//!   window, costing no memory; a window's real size is known only
//!   once consumed.
//! * [`OptionalBufferChunker`] streams directly when the total length
//!   is declared and buffers otherwise.

use std::io;

use crate::errors::{Result, StreamError};
use crate::source::ByteSource;

mod buffered;
mod direct;
mod optional;

pub use buffered::BufferedChunker;
pub use direct::DirectChunker;
pub use optional::OptionalBufferChunker;

/// Smallest chunk a splitter will ever use by default (5 MiB).
pub const MIN_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default upper bound on chunk size (512 MiB).
pub const MAX_CHUNK_SIZE: usize = 512 * 1024 * 1024;

/// Bounds applied to every requested chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    min: usize,
    max: usize,
}

impl ChunkLimits {
    pub fn new(min: usize, max: usize) -> Result<Self> {
        if min == 0 {
            return Err(StreamError::invalid("minimum chunk size must be positive"));
        }
        if min > max {
            return Err(StreamError::invalid(format!(
                "minimum chunk size {min} exceeds maximum {max}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Clamp `requested` into `[min, max]`, then cap it by the declared
    /// total.  Oversized requests silently get the maximum.
    pub fn effective(&self, requested: usize, total: Option<u64>) -> usize {
        let size = requested.min(self.max).max(self.min);
        match total {
            Some(total) => (size as u64).min(total).max(1) as usize,
            None => size,
        }
    }
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            min: MIN_CHUNK_SIZE,
            max: MAX_CHUNK_SIZE,
        }
    }
}

/// Chunked view over a source stream.
pub trait ChunkSource: ByteSource {
    /// Open the next window.  Returns `false` once the source is
    /// exhausted or the declared total was reached; the source is
    /// closed at that point and every later call returns `false`.
    fn next_chunk(&mut self) -> io::Result<bool>;

    fn is_chunks_done(&self) -> bool;

    /// Effective chunk size after clamping.
    fn chunk_size(&self) -> usize;

    /// Size of the current window.  Exact when buffered, an upper bound
    /// when streaming directly.
    fn current_chunk_size(&self) -> u64;

    /// Bytes consumed from the current window.
    fn current_pos(&self) -> u64;

    /// Bytes consumed across all windows.
    fn current_total_read(&self) -> u64;

    /// Bytes left in the current window (same precision as
    /// [`current_chunk_size`](Self::current_chunk_size)).
    fn available_chunk_size(&self) -> u64 {
        self.current_chunk_size().saturating_sub(self.current_pos())
    }

    /// End the whole sequence now and close the source.
    fn close_source(&mut self) -> io::Result<()>;
}

/// Buffering policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    Buffered,
    Direct,
    Optional,
}

impl ChunkStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkStrategy::Buffered => "buffered",
            ChunkStrategy::Direct => "direct",
            ChunkStrategy::Optional => "optional",
        }
    }
}

impl std::str::FromStr for ChunkStrategy {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buffered" => Ok(ChunkStrategy::Buffered),
            "direct" => Ok(ChunkStrategy::Direct),
            "optional" => Ok(ChunkStrategy::Optional),
            other => Err(StreamError::invalid(format!("unknown chunk strategy: {other}"))),
        }
    }
}

/// Build a boxed chunker for `strategy`.
pub fn chunker<S>(
    strategy: ChunkStrategy,
    source: S,
    total: Option<u64>,
    requested: usize,
    limits: ChunkLimits,
) -> Box<dyn ChunkSource>
where
    S: ByteSource + 'static,
{
    match strategy {
        ChunkStrategy::Buffered => Box::new(BufferedChunker::new(source, total, requested, limits)),
        ChunkStrategy::Direct => Box::new(DirectChunker::new(source, total, requested, limits)),
        ChunkStrategy::Optional => {
            Box::new(OptionalBufferChunker::new(source, total, requested, limits))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pattern, FakeSource};
    use proptest::prelude::*;
    use std::io::{Cursor, Read};

    const STRATEGIES: [ChunkStrategy; 3] = [
        ChunkStrategy::Buffered,
        ChunkStrategy::Direct,
        ChunkStrategy::Optional,
    ];

    fn read_window(chunk: &mut dyn ChunkSource, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match chunk.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn tiny_limits() -> ChunkLimits {
        ChunkLimits::new(4, 64).unwrap()
    }

    /// Read every window with `read_to_end` and return them.
    fn collect_chunks(chunk: &mut dyn ChunkSource) -> Vec<Vec<u8>> {
        let mut windows = Vec::new();
        while chunk.next_chunk().unwrap() {
            let mut window = Vec::new();
            chunk.read_to_end(&mut window).unwrap();
            windows.push(window);
        }
        windows
    }

    #[test]
    fn test_limits_validation() {
        assert!(ChunkLimits::new(0, 10).is_err());
        assert!(ChunkLimits::new(11, 10).is_err());
        let limits = ChunkLimits::new(10, 10).unwrap();
        assert_eq!((limits.min(), limits.max()), (10, 10));
    }

    #[test]
    fn test_effective_clamping() {
        let limits = ChunkLimits::new(4, 64).unwrap();
        assert_eq!(limits.effective(1, None), 4);
        assert_eq!(limits.effective(30, None), 30);
        // Oversized requests silently get the maximum.
        assert_eq!(limits.effective(10_000, None), 64);
        assert_eq!(limits.effective(30, Some(10)), 10);
        assert_eq!(limits.effective(30, Some(0)), 1);
    }

    #[test]
    fn test_default_limits() {
        let limits = ChunkLimits::default();
        assert_eq!(limits.effective(1, None), MIN_CHUNK_SIZE);
        assert_eq!(limits.effective(usize::MAX, None), MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("Direct".parse::<ChunkStrategy>().unwrap(), ChunkStrategy::Direct);
        assert!("sometimes".parse::<ChunkStrategy>().is_err());
        assert_eq!(ChunkStrategy::Optional.name(), "optional");
    }

    #[test]
    fn test_every_strategy_splits_exactly() {
        let data = pattern(1000);
        for strategy in STRATEGIES {
            for total in [None, Some(1000u64)] {
                let mut chunk = chunker(
                    strategy,
                    Cursor::new(data.clone()),
                    total,
                    64,
                    tiny_limits(),
                );
                let windows = collect_chunks(chunk.as_mut());
                assert_eq!(windows.len(), 16, "{strategy:?} {total:?}");
                assert!(windows.iter().all(|w| w.len() <= 64));
                assert_eq!(windows.concat(), data);
                assert_eq!(chunk.current_total_read(), 1000);
                assert!(chunk.is_chunks_done());
                assert!(!chunk.next_chunk().unwrap());
            }
        }
    }

    #[test]
    fn test_oversized_request_clamped_for_every_strategy() {
        let data = pattern(300);
        for strategy in STRATEGIES {
            let mut chunk = chunker(strategy, Cursor::new(data.clone()), None, 1 << 20, tiny_limits());
            assert_eq!(chunk.chunk_size(), 64);
            let windows = collect_chunks(chunk.as_mut());
            assert_eq!(windows.iter().map(Vec::len).max(), Some(64));
            assert_eq!(windows.concat(), data);
        }
    }

    #[test]
    fn test_empty_source_has_no_chunks() {
        for strategy in STRATEGIES {
            let mut chunk = chunker(strategy, Cursor::new(Vec::<u8>::new()), None, 8, tiny_limits());
            assert!(!chunk.next_chunk().unwrap());
            assert!(chunk.is_chunks_done());
            assert_eq!(chunk.current_total_read(), 0);
        }
    }

    #[test]
    fn test_window_respected_by_every_operation() {
        for strategy in STRATEGIES {
            let source = FakeSource::new(pattern(100)).max_read(7);
            let mut chunk = chunker(strategy, source, None, 10, tiny_limits());
            assert!(chunk.next_chunk().unwrap());

            assert_eq!(chunk.read_byte().unwrap(), Some(pattern(1)[0]));
            assert_eq!(chunk.skip(3).unwrap(), 3);
            assert_eq!(chunk.current_pos(), 4);
            let mut sink = Vec::new();
            assert_eq!(chunk.transfer_to(&mut sink).unwrap(), 6);
            assert_eq!(sink, pattern(10)[4..].to_vec());
            // End of chunk, not end of source.
            assert_eq!(chunk.read_byte().unwrap(), None);
            assert_eq!(chunk.skip(5).unwrap(), 0);
            assert!(!chunk.is_chunks_done());

            assert!(chunk.next_chunk().unwrap());
            assert_eq!(chunk.read_byte().unwrap(), Some(pattern(11)[10]));
        }
    }

    #[test]
    fn test_close_marks_window_consumed() {
        for strategy in STRATEGIES {
            let source = FakeSource::new(pattern(40));
            let closed = source.closed_flag();
            let mut chunk = chunker(strategy, source, None, 10, tiny_limits());
            assert!(chunk.next_chunk().unwrap());
            let mut buf = [0u8; 3];
            chunk.read_exact(&mut buf).unwrap();
            chunk.close().unwrap();
            assert_eq!(chunk.read_byte().unwrap(), None);
            assert!(!closed.load(std::sync::atomic::Ordering::SeqCst), "{strategy:?}");

            // Skipped remainder of the first window is not replayed.
            assert!(chunk.next_chunk().unwrap());
            chunk.close_source().unwrap();
            assert!(chunk.is_chunks_done());
            assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
            assert!(!chunk.next_chunk().unwrap());
        }
    }

    #[test]
    fn test_source_error_propagates() {
        for strategy in STRATEGIES {
            let source = FakeSource::new(pattern(100)).fail_at(30);
            let mut chunk = chunker(strategy, source, None, 20, tiny_limits());
            let mut failed = false;
            loop {
                match chunk.next_chunk() {
                    Ok(true) => {
                        let mut out = Vec::new();
                        if chunk.read_to_end(&mut out).is_err() {
                            failed = true;
                            break;
                        }
                    }
                    Ok(false) => break,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }
            assert!(failed, "{strategy:?}");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_chunks_cover_source_exactly_once(
            len in 0usize..2000,
            requested in 1usize..200,
            max_read in 1usize..50,
            declare_total in any::<bool>(),
            strategy_index in 0usize..3,
        ) {
            let data = pattern(len);
            let total = declare_total.then_some(len as u64);
            let limits = ChunkLimits::new(8, 128).unwrap();
            let source = FakeSource::new(data.clone()).max_read(max_read).hide_available();
            let mut chunk = chunker(STRATEGIES[strategy_index], source, total, requested, limits);
            let effective = limits.effective(requested, total);

            let mut seen = Vec::with_capacity(len);
            let mut buf = vec![0u8; 33];
            while chunk.next_chunk().unwrap() {
                let mut in_window = 0usize;
                loop {
                    let n = read_window(chunk.as_mut(), &mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    in_window += n;
                    seen.extend_from_slice(&buf[..n]);
                }
                prop_assert!(in_window <= effective);
            }
            prop_assert_eq!(seen, data);
            prop_assert_eq!(chunk.current_total_read(), len as u64);
            prop_assert!(chunk.is_chunks_done());
        }
    }
}

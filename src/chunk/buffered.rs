use std::io::{self, Read};

use metrics::counter;
use tracing::debug;

use super::{ChunkLimits, ChunkSource};
use crate::metrics::CHUNKS_TOTAL;
use crate::source::ByteSource;

/// Chunker that loads each window fully into memory on `next_chunk`.
pub struct BufferedChunker<S> {
    source: S,
    total: Option<u64>,
    chunk_size: usize,
    buffer: Vec<u8>,
    filled: usize,
    pos: usize,
    total_read: u64,
    pulled: u64,
    done: bool,
}

impl<S: ByteSource> BufferedChunker<S> {
    /// `total` is the declared source length when known.
    pub fn new(source: S, total: Option<u64>, requested: usize, limits: ChunkLimits) -> Self {
        Self {
            source,
            total,
            chunk_size: limits.effective(requested, total),
            buffer: Vec::new(),
            filled: 0,
            pos: 0,
            total_read: 0,
            pulled: 0,
            done: false,
        }
    }

    /// The current window's bytes, consumed or not.
    pub fn window(&self) -> &[u8] {
        &self.buffer[..self.filled]
    }

    fn fill(&mut self) -> io::Result<usize> {
        let want = match self.total {
            Some(total) => (self.chunk_size as u64).min(total - self.pulled) as usize,
            None => self.chunk_size,
        };
        if self.buffer.len() < want {
            self.buffer.resize(want, 0);
        }
        let mut filled = 0;
        while filled < want {
            match self.source.read(&mut self.buffer[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.pulled += filled as u64;
        self.filled = filled;
        Ok(filled)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.done = true;
        self.filled = 0;
        self.pos = 0;
        self.buffer = Vec::new();
        debug!("Buffered chunker done: total_read={}", self.total_read);
        self.source.close()
    }
}

impl<S: ByteSource> Read for BufferedChunker<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.filled - self.pos);
        buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        self.total_read += n as u64;
        Ok(n)
    }
}

impl<S: ByteSource> ByteSource for BufferedChunker<S> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let skipped = n.min((self.filled - self.pos) as u64);
        self.pos += skipped as usize;
        self.total_read += skipped;
        Ok(skipped)
    }

    fn available(&mut self) -> io::Result<usize> {
        Ok(self.filled - self.pos)
    }

    /// Marks the current window consumed.  The source stays open.
    fn close(&mut self) -> io::Result<()> {
        self.pos = self.filled;
        Ok(())
    }
}

impl<S: ByteSource> ChunkSource for BufferedChunker<S> {
    fn next_chunk(&mut self) -> io::Result<bool> {
        if self.done {
            return Ok(false);
        }
        self.pos = 0;
        self.filled = 0;
        let reached = self.total.is_some_and(|total| self.pulled >= total);
        if reached || self.fill()? == 0 {
            self.finish()?;
            return Ok(false);
        }
        counter!(CHUNKS_TOTAL, "strategy" => "buffered").increment(1);
        Ok(true)
    }

    fn is_chunks_done(&self) -> bool {
        self.done
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn current_chunk_size(&self) -> u64 {
        self.filled as u64
    }

    fn current_pos(&self) -> u64 {
        self.pos as u64
    }

    fn current_total_read(&self) -> u64 {
        self.total_read
    }

    fn close_source(&mut self) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pattern, FakeSource};

    fn limits() -> ChunkLimits {
        ChunkLimits::new(4, 32).unwrap()
    }

    #[test]
    fn test_window_size_known_before_reading() {
        let source = FakeSource::new(pattern(50)).max_read(3);
        let mut chunk = BufferedChunker::new(source, None, 20, limits());
        assert!(chunk.next_chunk().unwrap());
        assert_eq!(chunk.current_chunk_size(), 20);
        assert_eq!(chunk.available().unwrap(), 20);
        assert_eq!(chunk.window(), &pattern(20)[..]);

        assert!(chunk.next_chunk().unwrap());
        assert!(chunk.next_chunk().unwrap());
        assert_eq!(chunk.current_chunk_size(), 10);
        assert_eq!(chunk.available_chunk_size(), 10);
        assert!(!chunk.next_chunk().unwrap());
    }

    #[test]
    fn test_declared_total_stops_early() {
        // The source holds more than declared; only the declared part is used.
        let source = FakeSource::new(pattern(100));
        let mut chunk = BufferedChunker::new(source, Some(45), 20, limits());
        let mut total = 0;
        while chunk.next_chunk().unwrap() {
            let mut out = Vec::new();
            chunk.read_to_end(&mut out).unwrap();
            total += out.len();
        }
        assert_eq!(total, 45);
        assert_eq!(chunk.current_total_read(), 45);
    }

    #[test]
    fn test_chunk_capped_by_total() {
        let chunk = BufferedChunker::new(FakeSource::new(pattern(3)), Some(3), 20, limits());
        assert_eq!(chunk.chunk_size(), 3);
    }

    #[test]
    fn test_skip_and_partial_reads() {
        let mut chunk = BufferedChunker::new(FakeSource::new(pattern(30)), None, 10, limits());
        assert!(chunk.next_chunk().unwrap());
        let mut buf = [0u8; 4];
        assert_eq!(chunk.read(&mut buf).unwrap(), 4);
        assert_eq!(chunk.skip(100).unwrap(), 6);
        assert_eq!(chunk.read(&mut buf).unwrap(), 0);
        assert_eq!(chunk.current_total_read(), 10);
        assert_eq!(chunk.current_pos(), 10);
    }

    #[test]
    fn test_exhaustion_closes_source() {
        let source = FakeSource::new(pattern(5));
        let closed = source.closed_flag();
        let mut chunk = BufferedChunker::new(source, None, 8, limits());
        assert!(chunk.next_chunk().unwrap());
        assert!(!closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!chunk.next_chunk().unwrap());
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(chunk.is_chunks_done());
    }
}

use std::io::{self, Read};

use metrics::counter;
use tracing::debug;

use super::{ChunkLimits, ChunkSource};
use crate::metrics::CHUNKS_TOTAL;
use crate::source::ByteSource;

/// Chunker that reads straight from the source inside each window.
///
/// With a declared total, window boundaries are arithmetic.  Without
/// one, `next_chunk` pulls a single look-ahead byte to learn whether
/// the source is exhausted; that byte is served first in the new
/// window.  The source's `available` hint is never used for control
/// flow.
pub struct DirectChunker<S> {
    source: S,
    total: Option<u64>,
    chunk_size: usize,
    window: u64,
    pos: u64,
    total_read: u64,
    pulled: u64,
    lookahead: Option<u8>,
    done: bool,
}

impl<S: ByteSource> DirectChunker<S> {
    pub fn new(source: S, total: Option<u64>, requested: usize, limits: ChunkLimits) -> Self {
        Self {
            source,
            total,
            chunk_size: limits.effective(requested, total),
            window: 0,
            pos: 0,
            total_read: 0,
            pulled: 0,
            lookahead: None,
            done: false,
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.done = true;
        self.lookahead = None;
        debug!("Direct chunker done: total_read={}", self.total_read);
        self.source.close()
    }

    /// Drop whatever is left of the current window from the source.
    fn discard_rest(&mut self) -> io::Result<()> {
        let mut rest = self.window - self.pos;
        if self.lookahead.take().is_some() {
            rest -= 1;
        }
        if rest > 0 && !self.done {
            let skipped = self.source.skip(rest)?;
            self.pulled += skipped;
            if skipped < rest {
                self.finish()?;
            }
        }
        self.pos = self.window;
        Ok(())
    }
}

impl<S: ByteSource> Read for DirectChunker<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = (buf.len() as u64).min(self.window - self.pos) as usize;
        if limit == 0 {
            return Ok(0);
        }
        if let Some(byte) = self.lookahead.take() {
            buf[0] = byte;
            self.pos += 1;
            self.total_read += 1;
            return Ok(1);
        }
        if self.done {
            return Ok(0);
        }
        let n = self.source.read(&mut buf[..limit])?;
        if n == 0 {
            self.finish()?;
            return Ok(0);
        }
        self.pulled += n as u64;
        self.pos += n as u64;
        self.total_read += n as u64;
        Ok(n)
    }
}

impl<S: ByteSource> ByteSource for DirectChunker<S> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let want = n.min(self.window - self.pos);
        let mut skipped = 0;
        if want > 0 && self.lookahead.take().is_some() {
            skipped = 1;
        }
        if skipped < want && !self.done {
            let from_source = self.source.skip(want - skipped)?;
            self.pulled += from_source;
            if from_source < want - skipped {
                self.finish()?;
            }
            skipped += from_source;
        }
        self.pos += skipped;
        self.total_read += skipped;
        Ok(skipped)
    }

    /// Hint only: the source's own hint plus any look-ahead byte,
    /// capped by the window.
    fn available(&mut self) -> io::Result<usize> {
        let remaining = self.window - self.pos;
        let pending = self.lookahead.is_some() as u64;
        let from_source = if self.done {
            0
        } else {
            self.source.available()? as u64
        };
        Ok((from_source + pending).min(remaining) as usize)
    }

    /// Marks the current window consumed, discarding its unread bytes.
    /// The source stays open.
    fn close(&mut self) -> io::Result<()> {
        self.discard_rest()
    }
}

impl<S: ByteSource> ChunkSource for DirectChunker<S> {
    fn next_chunk(&mut self) -> io::Result<bool> {
        if self.done {
            return Ok(false);
        }
        if self.pos < self.window {
            self.discard_rest()?;
            if self.done {
                return Ok(false);
            }
        }
        self.pos = 0;
        self.window = 0;
        match self.total {
            Some(total) => {
                if self.pulled >= total {
                    self.finish()?;
                    return Ok(false);
                }
                self.window = (self.chunk_size as u64).min(total - self.pulled);
            }
            None => {
                match self.source.read_byte()? {
                    Some(byte) => {
                        self.lookahead = Some(byte);
                        self.pulled += 1;
                    }
                    None => {
                        self.finish()?;
                        return Ok(false);
                    }
                }
                self.window = self.chunk_size as u64;
            }
        }
        counter!(CHUNKS_TOTAL, "strategy" => "direct").increment(1);
        Ok(true)
    }

    fn is_chunks_done(&self) -> bool {
        self.done
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn current_chunk_size(&self) -> u64 {
        self.window
    }

    fn current_pos(&self) -> u64 {
        self.pos
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

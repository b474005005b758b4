use std::io::{self, Read};

use super::{BufferedChunker, ChunkLimits, ChunkSource, DirectChunker};
use crate::source::ByteSource;

/// Streams directly when the total length is declared, since window
/// boundaries are then arithmetic; buffers otherwise so that each
/// window's size is known up front.
pub enum OptionalBufferChunker<S> {
    Direct(DirectChunker<S>),
    Buffered(BufferedChunker<S>),
}

impl<S: ByteSource> OptionalBufferChunker<S> {
    pub fn new(source: S, total: Option<u64>, requested: usize, limits: ChunkLimits) -> Self {
        match total {
            Some(_) => Self::Direct(DirectChunker::new(source, total, requested, limits)),
            None => Self::Buffered(BufferedChunker::new(source, None, requested, limits)),
        }
    }

    pub fn is_buffering(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }

    fn inner(&self) -> &dyn ChunkSource {
        match self {
            Self::Direct(c) => c,
            Self::Buffered(c) => c,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ChunkSource {
        match self {
            Self::Direct(c) => c,
            Self::Buffered(c) => c,
        }
    }
}

impl<S: ByteSource> Read for OptionalBufferChunker<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_mut().read(buf)
    }
}

impl<S: ByteSource> ByteSource for OptionalBufferChunker<S> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.inner_mut().skip(n)
    }

    fn available(&mut self) -> io::Result<usize> {
        self.inner_mut().available()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner_mut().close()
    }
}

impl<S: ByteSource> ChunkSource for OptionalBufferChunker<S> {
    fn next_chunk(&mut self) -> io::Result<bool> {
        self.inner_mut().next_chunk()
    }

    fn is_chunks_done(&self) -> bool {
        self.inner().is_chunks_done()
    }

    fn chunk_size(&self) -> usize {
        self.inner().chunk_size()
    }

    fn current_chunk_size(&self) -> u64 {
        self.inner().current_chunk_size()
    }

    fn current_pos(&self) -> u64 {
        self.inner().current_pos()
    }

    fn current_total_read(&self) -> u64 {
        self.inner().current_total_read()
    }

    fn close_source(&mut self) -> io::Result<()> {
        self.inner_mut().close_source()
    }
}

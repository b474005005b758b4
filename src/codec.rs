//! zstd stream codecs.
//!
//! Compression is driven by a background [`TransferSource`], since the
//! encoder is write-oriented.  Decompression is a plain read filter on
//! the caller's thread and accepts concatenated frames.

use std::io::{self, BufReader, Read};

use crate::errors::ErrorSlot;
use crate::source::ByteSource;
use crate::transfer::{TransferOptions, TransferSource};

/// Compress `source` with zstd at `level` (0 is the library default).
pub fn compress<S>(
    source: S,
    level: i32,
    options: TransferOptions,
    errors: ErrorSlot,
) -> io::Result<TransferSource>
where
    S: ByteSource + 'static,
{
    TransferSource::spawn("zstd-compress", source, options, errors, move |source, sink| {
        let mut encoder = zstd::stream::write::Encoder::new(sink, level)?;
        let consumed = source.transfer_to(&mut encoder)?;
        encoder.finish()?;
        Ok(consumed)
    })
}

/// Decompressing read filter.
pub struct ZstdDecoder<S: ByteSource> {
    decoder: Option<zstd::stream::read::Decoder<'static, BufReader<S>>>,
}

impl<S: ByteSource> ZstdDecoder<S> {
    pub fn new(source: S) -> io::Result<Self> {
        Ok(Self {
            decoder: Some(zstd::stream::read::Decoder::new(source)?),
        })
    }
}

impl<S: ByteSource> Read for ZstdDecoder<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "decoder already closed",
            )),
        }
    }
}

impl<S: ByteSource> ByteSource for ZstdDecoder<S> {
    fn close(&mut self) -> io::Result<()> {
        match self.decoder.take() {
            Some(mut decoder) => decoder.get_mut().get_mut().close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pattern, random_bytes, FakeSource};
    use std::io::Cursor;
    use std::sync::atomic::Ordering;

    fn options() -> TransferOptions {
        TransferOptions {
            buffer_size: 4096,
            pipe_depth: 4,
        }
    }

    #[test]
    fn test_compress_then_decompress() {
        let data = pattern(2 * 1024 * 1024);
        let mut compressed = Vec::new();
        compress(Cursor::new(data.clone()), 3, options(), ErrorSlot::new())
            .unwrap()
            .read_to_end(&mut compressed)
            .unwrap();
        assert!(compressed.len() < data.len());

        let mut decoder = ZstdDecoder::new(Cursor::new(compressed)).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_matches_one_shot_library_output() {
        let data = random_bytes(50_000);
        let mut compressed = Vec::new();
        compress(Cursor::new(data.clone()), 0, options(), ErrorSlot::new())
            .unwrap()
            .read_to_end(&mut compressed)
            .unwrap();
        assert_eq!(zstd::decode_all(Cursor::new(compressed)).unwrap(), data);
    }

    #[test]
    fn test_concatenated_frames() {
        let mut joined = zstd::encode_all(&b"first "[..], 0).unwrap();
        joined.extend(zstd::encode_all(&b"second"[..], 0).unwrap());
        let mut out = String::new();
        ZstdDecoder::new(Cursor::new(joined))
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "first second");
    }

    #[test]
    fn test_garbage_input_fails() {
        let mut decoder = ZstdDecoder::new(Cursor::new(vec![0x42u8; 64])).unwrap();
        let mut out = Vec::new();
        assert!(decoder.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_close_reaches_source() {
        let compressed = zstd::encode_all(&pattern(1000)[..], 0).unwrap();
        let source = FakeSource::new(compressed);
        let closed = source.closed_flag();
        let mut decoder = ZstdDecoder::new(source).unwrap();
        decoder.close().unwrap();
        decoder.close().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(decoder.read(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_compress_source_failure_surfaces() {
        let source = FakeSource::new(pattern(100_000)).fail_at(50_000);
        let mut stream = compress(source, 1, options(), ErrorSlot::new()).unwrap();
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("injected failure"));
    }
}

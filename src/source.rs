//! The byte-stream capability shared by every wrapper in the crate.
//!
//! [`ByteSource`] extends [`Read`] with the handful of operations the
//! data plane relies on: an `available` hint, bounded `skip`, a
//! whole-stream `transfer_to`, and an explicit idempotent `close`.
//! None of the implementations support rewinding.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// Slice size used by the default `skip` and `transfer_to`.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Closes a source from another thread, even while a read is blocked on it.
pub type CloseHandle = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// A readable byte stream with the extra operations every data-plane
/// wrapper exposes.
pub trait ByteSource: Read + Send {
    /// Read one byte, `None` at end of stream.
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Discard up to `n` bytes, returning how many were skipped.
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut scratch = vec![0u8; DEFAULT_BUFFER_SIZE.min(n as usize).max(1)];
        let mut skipped = 0u64;
        while skipped < n {
            let want = scratch.len().min((n - skipped) as usize);
            match self.read(&mut scratch[..want]) {
                Ok(0) => break,
                Ok(read) => skipped += read as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(skipped)
    }

    /// Bytes that can be read without blocking.  A hint only.
    fn available(&mut self) -> io::Result<usize> {
        Ok(0)
    }

    /// Copy everything that remains into `sink`.
    fn transfer_to(&mut self, sink: &mut dyn Write) -> io::Result<u64> {
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match self.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    sink.write_all(&buf[..n])?;
                    total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Release owned resources.  Calling it again is a no-op.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn mark_supported(&self) -> bool {
        false
    }

    /// Handle that closes this source while another thread owns it.
    /// `None` when the source cannot be closed concurrently; it is then
    /// only closed by its owner.
    fn close_handle(&self) -> Option<CloseHandle> {
        None
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        (**self).read_byte()
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        (**self).skip(n)
    }

    fn available(&mut self) -> io::Result<usize> {
        (**self).available()
    }

    fn transfer_to(&mut self, sink: &mut dyn Write) -> io::Result<u64> {
        (**self).transfer_to(sink)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        (**self).close_handle()
    }
}

impl<T: AsRef<[u8]> + Send> ByteSource for Cursor<T> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let len = self.get_ref().as_ref().len() as u64;
        let pos = self.position().min(len);
        let skipped = n.min(len - pos);
        self.set_position(pos + skipped);
        Ok(skipped)
    }

    fn available(&mut self) -> io::Result<usize> {
        let len = self.get_ref().as_ref().len() as u64;
        Ok(len.saturating_sub(self.position()) as usize)
    }
}

impl ByteSource for File {}

fn shutdown(stream: &TcpStream) -> io::Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl ByteSource for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        shutdown(self)
    }

    /// Shuts the socket down through a cloned descriptor, which wakes a
    /// read blocked on the original.
    fn close_handle(&self) -> Option<CloseHandle> {
        let stream = self.try_clone().ok()?;
        Some(Arc::new(move || shutdown(&stream)))
    }
}

/// Adapter turning any `Read` into a [`ByteSource`].
///
/// `close` drops the inner reader; later reads report end of stream
/// as an error rather than silently returning zero.
pub struct ReaderSource<R> {
    inner: Option<R>,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl<R: Read + Send> Read for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "read on closed source",
            )),
        }
    }
}

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn close(&mut self) -> io::Result<()> {
        self.inner = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_byte_until_end() {
        let mut src = Cursor::new(vec![7u8, 9]);
        assert_eq!(src.read_byte().unwrap(), Some(7));
        assert_eq!(src.read_byte().unwrap(), Some(9));
        assert_eq!(src.read_byte().unwrap(), None);
    }

    #[test]
    fn test_cursor_skip_is_bounded() {
        let mut src = Cursor::new(vec![0u8; 10]);
        assert_eq!(src.skip(4).unwrap(), 4);
        assert_eq!(src.available().unwrap(), 6);
        assert_eq!(src.skip(100).unwrap(), 6);
        assert_eq!(src.available().unwrap(), 0);
    }

    #[test]
    fn test_default_skip_reads_and_discards() {
        let mut src = ReaderSource::new(&b"abcdefgh"[..]);
        assert_eq!(src.skip(3).unwrap(), 3);
        assert_eq!(src.read_byte().unwrap(), Some(b'd'));
        assert_eq!(src.skip(50).unwrap(), 4);
    }

    #[test]
    fn test_transfer_to_copies_everything() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let mut src = ReaderSource::new(Cursor::new(data.clone()));
        let mut sink = Vec::new();
        assert_eq!(src.transfer_to(&mut sink).unwrap(), data.len() as u64);
        assert_eq!(sink, data);
    }

    #[test]
    fn test_tcp_close_handle_wakes_blocked_read() {
        use std::net::TcpListener;
        use std::thread;
        use std::time::Duration;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();
        let handle = client.close_handle().unwrap();
        let reader = thread::spawn(move || client.read(&mut [0u8; 16]));
        thread::sleep(Duration::from_millis(100));
        handle().unwrap();
        handle().unwrap();
        // Woken either with end of stream or an error, never left hanging.
        match reader.join().unwrap() {
            Ok(n) => assert_eq!(n, 0),
            Err(_) => {}
        }
    }

    #[test]
    fn test_close_handle_absent_by_default() {
        let src = Cursor::new(vec![1u8]);
        assert!(src.close_handle().is_none());
        let boxed: Box<dyn ByteSource> = Box::new(src);
        assert!(boxed.close_handle().is_none());
    }

    #[test]
    fn test_reader_source_close() {
        let mut src = ReaderSource::new(&b"abc"[..]);
        src.close().unwrap();
        src.close().unwrap();
        assert!(src.is_closed());
        assert!(src.read_byte().is_err());
        assert!(!src.mark_supported());
    }
}

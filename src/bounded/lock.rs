//! Producer/consumer capacity accounting for one ring reader.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct LockState {
    write_capacity: usize,
    read_capacity: usize,
    closed: bool,
}

/// Two counters guarded by one mutex: bytes the writer may still
/// produce for this reader, and bytes this reader may consume.
///
/// At rest `write_capacity + read_capacity` equals the ring capacity.
/// Closing is terminal.  No operation fails; exhaustion and closure are
/// reported through return values.
#[derive(Debug)]
pub struct BoundedLock {
    state: Mutex<LockState>,
    writable: Condvar,
    readable: Condvar,
}

impl BoundedLock {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LockState {
                write_capacity: capacity,
                read_capacity: 0,
                closed: false,
            }),
            writable: Condvar::new(),
            readable: Condvar::new(),
        }
    }

    /// Block until `n` bytes of write capacity are free, then take
    /// them.  Returns `false` if the lock is closed first; nothing is
    /// taken in that case.
    pub fn reserve_for_write(&self, n: usize) -> bool {
        let mut state = self.state.lock();
        while !state.closed && state.write_capacity < n {
            self.writable.wait(&mut state);
        }
        if state.closed {
            return false;
        }
        state.write_capacity -= n;
        true
    }

    /// Give back `n` bytes of write capacity after the reader consumed them.
    pub fn release_for_write(&self, n: usize) {
        let mut state = self.state.lock();
        state.write_capacity += n;
        self.writable.notify_one();
    }

    /// Block until at least one byte is readable, then take up to `n`.
    ///
    /// Buffered bytes stay readable after close; `0` means closed with
    /// nothing pending.
    pub fn reserve_for_read(&self, n: usize) -> usize {
        let mut state = self.state.lock();
        while !state.closed && state.read_capacity == 0 {
            self.readable.wait(&mut state);
        }
        let granted = n.min(state.read_capacity);
        state.read_capacity -= granted;
        granted
    }

    /// Publish `n` freshly written bytes to the reader.
    pub fn release_for_read(&self, n: usize) {
        let mut state = self.state.lock();
        state.read_capacity += n;
        self.readable.notify_one();
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.writable.notify_all();
        self.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Readable bytes right now; `0` once closed.
    pub fn peek_available(&self) -> usize {
        let state = self.state.lock();
        if state.closed {
            0
        } else {
            state.read_capacity
        }
    }

    /// `(write_capacity, read_capacity)` snapshot.
    pub fn capacities(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.write_capacity, state.read_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reserve_and_release_round() {
        let lock = BoundedLock::new(100);
        assert!(lock.reserve_for_write(60));
        assert_eq!(lock.capacities(), (40, 0));
        lock.release_for_read(60);
        assert_eq!(lock.peek_available(), 60);

        // Partial reservation: ask for more than is there.
        assert_eq!(lock.reserve_for_read(80), 60);
        lock.release_for_write(60);
        assert_eq!(lock.capacities(), (100, 0));
    }

    #[test]
    fn test_partial_read_reservation() {
        let lock = BoundedLock::new(10);
        assert!(lock.reserve_for_write(10));
        lock.release_for_read(10);
        assert_eq!(lock.reserve_for_read(3), 3);
        assert_eq!(lock.reserve_for_read(3), 3);
        assert_eq!(lock.reserve_for_read(30), 4);
    }

    #[test]
    fn test_closed_write_reservation_takes_nothing() {
        let lock = BoundedLock::new(10);
        lock.close();
        assert!(!lock.reserve_for_write(1));
        assert_eq!(lock.capacities(), (10, 0));
        assert!(lock.is_closed());
    }

    #[test]
    fn test_pending_bytes_survive_close() {
        let lock = BoundedLock::new(10);
        assert!(lock.reserve_for_write(4));
        lock.release_for_read(4);
        lock.close();
        assert_eq!(lock.peek_available(), 0);
        assert_eq!(lock.reserve_for_read(10), 4);
        assert_eq!(lock.reserve_for_read(10), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let lock = BoundedLock::new(1);
        lock.close();
        lock.close();
        assert!(lock.is_closed());
    }

    #[test]
    fn test_writer_waits_for_space() {
        let lock = Arc::new(BoundedLock::new(8));
        assert!(lock.reserve_for_write(8));
        lock.release_for_read(8);

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let lock = lock.clone();
            let done = done.clone();
            thread::spawn(move || {
                let ok = lock.reserve_for_write(4);
                done.store(true, Ordering::SeqCst);
                ok
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        assert_eq!(lock.reserve_for_read(4), 4);
        lock.release_for_write(4);
        assert!(writer.join().unwrap());
        assert_eq!(lock.capacities(), (0, 4));
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let lock = Arc::new(BoundedLock::new(8));
        let reader = {
            let lock = lock.clone();
            thread::spawn(move || lock.reserve_for_read(4))
        };
        thread::sleep(Duration::from_millis(20));
        lock.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_close_wakes_blocked_writer() {
        let lock = Arc::new(BoundedLock::new(2));
        let writer = {
            let lock = lock.clone();
            thread::spawn(move || lock.reserve_for_write(3))
        };
        thread::sleep(Duration::from_millis(20));
        lock.close();
        assert!(!writer.join().unwrap());
    }
}

//! Bounded single-writer / multi-reader circular buffer.
//!
//! [`BoundedLock`] does the per-reader flow control and [`BoundedRing`]
//! stitches one byte array and N locks into a broadcast tee: every
//! reader sees every byte, and the writer is gated by the slowest live
//! reader.

pub mod lock;
pub mod ring;

pub use lock::BoundedLock;
pub use ring::{BoundedRing, RingReader, RingWriter};

//! fanstore -- streaming data plane for a multi-site object store.
//!
//! This crate moves object bytes between a producer (a network body or
//! a storage driver) and one or more consumers under bounded memory:
//!
//! - [`bounded`]: the single-writer / multi-reader ring and its locks
//! - [`tee`]: fan-out of one source to N independently paced readers
//! - [`chunk`]: carving a source into bounded chunk windows
//! - [`pipeline`]: digest, zstd codec, stall watchdog, completion wait
//! - [`transfer`] and [`pipe`]: background copy of a source into a pipe
//!
//! Every stream implements [`source::ByteSource`], so any wrapper can be
//! stacked on any other.

pub mod bounded;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod digest;
pub mod errors;
pub mod metrics;
pub mod pipe;
pub mod pipeline;
pub mod source;
pub mod tee;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

pub use bounded::{BoundedLock, BoundedRing, RingReader, RingWriter};
pub use chunk::{chunker, ChunkLimits, ChunkSource, ChunkStrategy};
pub use digest::DigestAlgorithm;
pub use errors::{ErrorSlot, StreamError};
pub use pipeline::{ActionPipeline, PipelineHandle};
pub use source::{ByteSource, ReaderSource};
pub use tee::{TeeReader, TeeSplitter};
pub use transfer::TransferSource;

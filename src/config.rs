//! Configuration loading and types for fanstore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs one part of the data
//! plane: stream buffering and stall detection, chunk sizing, digest
//! defaults, compression, and logging.  Components never read this
//! struct globally; callers pass the relevant section down.

use garde::Validate;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::chunk::ChunkLimits;
use crate::digest::DigestAlgorithm;
use crate::errors::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Config {
    /// Buffer sizes and timing for every stream wrapper.
    #[serde(default)]
    #[garde(dive)]
    pub stream: StreamConfig,

    /// Chunk splitter sizing.
    #[serde(default)]
    #[garde(dive)]
    pub chunk: ChunkConfig,

    /// Default digest settings.
    #[serde(default)]
    #[garde(skip)]
    pub digest: DigestConfig,

    /// Compression settings.
    #[serde(default)]
    #[garde(dive)]
    pub compression: CompressionConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,
}

/// Buffering and timing shared by all stream wrappers.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StreamConfig {
    /// Standard I/O buffer size in bytes (default 128 KiB).
    #[serde(default = "default_buffer_size")]
    #[garde(range(min = 1))]
    pub buffer_size: usize,

    /// Tee ring capacity expressed as a multiple of `buffer_size`.
    #[serde(default = "default_tee_buffer_factor")]
    #[garde(range(min = 1))]
    pub tee_buffer_factor: usize,

    /// Number of in-flight buffers a pipe may hold.
    #[serde(default = "default_pipe_depth")]
    #[garde(range(min = 1))]
    pub pipe_depth: usize,

    /// Maximum gap between two reads before a pipeline is declared stalled.
    #[serde(default = "default_max_wait_ms")]
    #[garde(range(min = 1))]
    pub max_wait_ms: u64,

    /// Poll slice used while waiting for a pipeline to be drained.
    #[serde(default = "default_wait_poll_ms")]
    #[garde(range(min = 1))]
    pub wait_poll_ms: u64,
}

impl StreamConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    /// Ring capacity used by the tee splitter.
    pub fn tee_capacity(&self) -> usize {
        self.buffer_size.saturating_mul(self.tee_buffer_factor)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            tee_buffer_factor: default_tee_buffer_factor(),
            pipe_depth: default_pipe_depth(),
            max_wait_ms: default_max_wait_ms(),
            wait_poll_ms: default_wait_poll_ms(),
        }
    }
}

/// Chunk sizing bounds.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChunkConfig {
    /// Chunk size used when the caller does not ask for one.
    #[serde(default = "default_chunk_size")]
    #[garde(range(min = 1))]
    pub default_chunk_size: usize,

    /// Smallest chunk ever produced (5 MiB).
    #[serde(default = "default_min_chunk_size")]
    #[garde(range(min = 1))]
    pub min_chunk_size: usize,

    /// Largest chunk ever produced (512 MiB).  Larger requests are
    /// silently clamped to this value.
    #[serde(default = "default_max_chunk_size")]
    #[garde(range(min = 1))]
    pub max_chunk_size: usize,
}

impl ChunkConfig {
    pub fn limits(&self) -> Result<ChunkLimits> {
        ChunkLimits::new(self.min_chunk_size, self.max_chunk_size)
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// Digest defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct DigestConfig {
    /// Compute a digest on every pipeline the CLI builds.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Algorithm: md5, sha256 or sha512.
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            algorithm: DigestAlgorithm::default(),
        }
    }
}

/// Compression settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CompressionConfig {
    /// zstd level; 0 selects the library default.
    #[serde(default)]
    #[garde(range(min = -7, max = 22))]
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { level: 0 }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_buffer_size() -> usize {
    128 * 1024
}

fn default_tee_buffer_factor() -> usize {
    10
}

fn default_pipe_depth() -> usize {
    4
}

fn default_max_wait_ms() -> u64 {
    1000
}

fn default_wait_poll_ms() -> u64 {
    100
}

fn default_chunk_size() -> usize {
    5 * 1024 * 1024
}

fn default_min_chunk_size() -> usize {
    5 * 1024 * 1024
}

fn default_max_chunk_size() -> usize {
    512 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Load configuration from a YAML file at the given path.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    config.chunk.limits()?;
    Ok(config)
}

//! fanstore -- command-line driver for the streaming data plane.
//!
//! Runs the digest, codec, tee and chunk primitives against local
//! files.  Useful to inspect behaviour and to measure throughput.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fanstore::chunk::{chunker, ChunkSource, ChunkStrategy};
use fanstore::config::{load_config, Config, LoggingConfig};
use fanstore::digest::DigestAlgorithm;
use fanstore::pipeline::ActionPipeline;
use fanstore::source::ByteSource;
use fanstore::tee::TeeSplitter;

/// Command-line arguments for fanstore.
#[derive(Parser, Debug)]
#[command(
    name = "fanstore",
    version,
    about = "Streaming data plane tools: digest, compress, tee and split object bytes"
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics once the command finished.
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Digest a file and print hex, base64 and base32 forms.
    Digest {
        input: PathBuf,
        /// md5, sha256 or sha512 (defaults to the configured algorithm).
        #[arg(short, long)]
        algorithm: Option<DigestAlgorithm>,
        /// Read the file on a background thread through a pipe.
        #[arg(long)]
        piped: bool,
    },
    /// zstd-compress a file.
    Compress {
        input: PathBuf,
        output: PathBuf,
        /// zstd level (defaults to the configured level).
        #[arg(short, long)]
        level: Option<i32>,
    },
    /// zstd-decompress a file.
    Decompress { input: PathBuf, output: PathBuf },
    /// Copy one file to several outputs through a single tee.
    Tee {
        input: PathBuf,
        #[arg(required = true)]
        outputs: Vec<PathBuf>,
        /// Seconds to wait for every branch to drain.
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
    /// Split a file into numbered part files.
    Split {
        input: PathBuf,
        out_dir: PathBuf,
        /// Requested chunk size in bytes (clamped to the configured bounds).
        #[arg(long)]
        chunk_size: Option<usize>,
        /// buffered, direct or optional.
        #[arg(long, default_value = "optional")]
        strategy: ChunkStrategy,
        /// Tell the chunker the file length up front.
        #[arg(long)]
        declare_length: bool,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config.logging);
    if let Some(path) = &cli.config {
        info!("Configuration loaded from {}", path.display());
    }

    if cli.print_metrics {
        fanstore::metrics::init_metrics()?;
        fanstore::metrics::describe_metrics();
    }

    let started = Instant::now();
    match cli.command {
        Command::Digest {
            input,
            algorithm,
            piped,
        } => run_digest(&config, &input, algorithm, piped)?,
        Command::Compress {
            input,
            output,
            level,
        } => run_compress(&config, &input, &output, level)?,
        Command::Decompress { input, output } => run_decompress(&config, &input, &output)?,
        Command::Tee {
            input,
            outputs,
            wait_secs,
        } => run_tee(&config, &input, &outputs, Duration::from_secs(wait_secs))?,
        Command::Split {
            input,
            out_dir,
            chunk_size,
            strategy,
            declare_length,
        } => run_split(&config, &input, &out_dir, chunk_size, strategy, declare_length)?,
    }
    info!("Done in {} ms", started.elapsed().as_millis());

    if cli.print_metrics {
        if let Some(text) = fanstore::metrics::render_metrics() {
            print!("{text}");
        }
    }
    Ok(())
}

fn open(path: &Path) -> anyhow::Result<File> {
    File::open(path).with_context(|| format!("opening {}", path.display()))
}

fn create(path: &Path) -> anyhow::Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn print_digest(label: &str, pipeline: &mut ActionPipeline) {
    if let (Some(hex), Some(b64), Some(b32)) = (
        pipeline.digest_hex(),
        pipeline.digest_base64(),
        pipeline.digest_base32(),
    ) {
        println!("{label}\thex={hex}\tbase64={b64}\tbase32={b32}");
    }
}

fn run_digest(
    config: &Config,
    input: &Path,
    algorithm: Option<DigestAlgorithm>,
    piped: bool,
) -> anyhow::Result<()> {
    let mut pipeline = ActionPipeline::new(open(input)?, &config.stream);
    pipeline.compute_digest(algorithm.unwrap_or(config.digest.algorithm))?;
    if piped {
        pipeline.async_piped_transfer()?;
    }
    let bytes = pipeline.transfer_to(&mut std::io::sink())?;
    pipeline.close()?;
    info!("Digested {} bytes ({})", bytes, pipeline.read_stats());
    print_digest(&input.display().to_string(), &mut pipeline);
    Ok(())
}

fn run_compress(
    config: &Config,
    input: &Path,
    output: &Path,
    level: Option<i32>,
) -> anyhow::Result<()> {
    let mut pipeline = ActionPipeline::from_config(open(input)?, config);
    match level {
        Some(level) => pipeline.compress_with_level(level)?,
        None => pipeline.compress()?,
    }
    let mut sink = create(output)?;
    let written = pipeline.transfer_to(&mut sink)?;
    sink.flush()?;
    pipeline.close()?;
    info!(
        "Compressed {} -> {} bytes",
        pipeline.source_read(),
        written
    );
    print_digest(&output.display().to_string(), &mut pipeline);
    Ok(())
}

fn run_decompress(config: &Config, input: &Path, output: &Path) -> anyhow::Result<()> {
    let mut pipeline = ActionPipeline::from_config(open(input)?, config);
    pipeline.decompress()?;
    let mut sink = create(output)?;
    let written = pipeline.transfer_to(&mut sink)?;
    sink.flush()?;
    pipeline.close()?;
    info!(
        "Decompressed {} -> {} bytes",
        pipeline.source_read(),
        written
    );
    print_digest(&output.display().to_string(), &mut pipeline);
    Ok(())
}

fn run_tee(
    config: &Config,
    input: &Path,
    outputs: &[PathBuf],
    wait: Duration,
) -> anyhow::Result<()> {
    let mut tee = TeeSplitter::new(open(input)?, outputs.len(), &config.stream)?;

    let mut handles = Vec::with_capacity(outputs.len());
    let mut branches = Vec::with_capacity(outputs.len());
    for (index, output) in outputs.iter().enumerate() {
        let mut pipeline = ActionPipeline::from_config(tee.reader(index)?, config);
        // Branch stalls are governed by the tee's backpressure, not the watchdog.
        pipeline.set_stall_is_error(false);
        handles.push(pipeline.handle());
        let mut sink = create(output)?;
        let label = output.display().to_string();
        branches.push(thread::spawn(move || -> anyhow::Result<()> {
            pipeline.transfer_to(&mut sink)?;
            sink.flush()?;
            pipeline.close()?;
            print_digest(&label, &mut pipeline);
            Ok(())
        }));
    }

    for (index, handle) in handles.iter().enumerate() {
        let total = handle.wait_for_all_read(wait);
        if total < 0 {
            warn!("Branch {} did not drain within {} s", index, wait.as_secs());
        } else {
            info!("Branch {} drained {} bytes", index, total);
        }
    }
    for branch in branches {
        match branch.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("tee branch thread panicked"),
        }
    }
    tee.join()?;
    Ok(())
}

fn run_split(
    config: &Config,
    input: &Path,
    out_dir: &Path,
    chunk_size: Option<usize>,
    strategy: ChunkStrategy,
    declare_length: bool,
) -> anyhow::Result<()> {
    let file = open(input)?;
    let total = if declare_length {
        Some(file.metadata()?.len())
    } else {
        None
    };
    fs::create_dir_all(out_dir)?;

    let requested = chunk_size.unwrap_or(config.chunk.default_chunk_size);
    let mut chunks = chunker(strategy, file, total, requested, config.chunk.limits()?);
    info!(
        "Splitting {} with {} chunker, chunk size {}",
        input.display(),
        strategy.name(),
        chunks.chunk_size()
    );

    let mut part = 0usize;
    while chunks.next_chunk()? {
        part += 1;
        let path = out_dir.join(format!("part-{part:05}"));
        let mut sink = create(&path)?;
        let written = chunks.transfer_to(&mut sink)?;
        sink.flush()?;
        info!("Wrote {} ({} bytes)", path.display(), written);
    }
    println!(
        "{} parts, {} bytes",
        part,
        chunks.current_total_read()
    );
    Ok(())
}

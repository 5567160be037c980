//! `mkdwarfs` — scan a directory tree and write a DwarFS image.
//!
//! Flag names follow `original_source/src/mkdwarfs.cpp`'s boost::program_options
//! surface (`block-size-bits`, `window-increment-shift`, `file-order`, ...)
//! translated into a `clap::Parser` derive, the way the teacher's `main.rs`
//! wires `Commands::Pack` onto `PackOptions`.

use clap::Parser;
use dwarfsrs::scanner::chmod::ChmodTransformer;
use dwarfsrs::scanner::Filter;
use dwarfsrs::{CodecKind, HashAlgo, Level, NilsimsaOptions, OrderMode, Writer, WriterOptions};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "mkdwarfs", version, about = "Create a DwarFS image from a directory tree")]
struct Cli {
    /// Source directory to scan
    #[arg(short, long)]
    input: PathBuf,

    /// Path of the image to create
    #[arg(short, long)]
    output: PathBuf,

    /// Compression algorithm: none, zstd, lz4, brotli, lzma, fsst
    #[arg(short = 'l', long, default_value = "zstd")]
    compression: String,

    /// Compression level, meaning depends on --compression
    #[arg(long, default_value_t = 19)]
    compression_level: i32,

    /// log2 of the target block size in bytes (e.g. 24 = 16 MiB blocks)
    #[arg(short = 'S', long, default_value_t = 24)]
    block_size_bits: u32,

    /// Rolling-hash window sizes in bytes, comma-separated
    #[arg(short = 'W', long, default_value = "4096", value_delimiter = ',')]
    window_sizes: Vec<usize>,

    /// log2 increment between successive rolling-hash probes
    #[arg(long, default_value_t = 1)]
    window_increment_shift: u32,

    /// log2 of the segmenter's rolling-hash table size
    #[arg(long, default_value_t = 20)]
    table_bits: u32,

    /// Files larger than this (bytes) skip similarity scoring and are
    /// placed first, largest first
    #[arg(long, default_value_t = 256 << 20)]
    max_similarity_size: u64,

    /// File ordering: none, path, revpath, similarity, nilsimsa
    #[arg(long, default_value = "revpath")]
    file_order: String,

    /// Hash algorithm used to detect duplicate file content: blake3, none
    #[arg(long, default_value = "blake3")]
    file_hash: String,

    /// `+pattern`/`-pattern` filter rules applied in order, repeatable
    #[arg(long = "filter")]
    filter_rules: Vec<String>,

    /// chmod spec applied to every scanned entry (coreutils chmod(1) grammar)
    #[arg(long)]
    chmod: Option<String>,

    /// Number of worker threads (0 = number of CPUs)
    #[arg(short = 'j', long, default_value_t = 0)]
    num_workers: usize,

    /// Log level: debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_order(s: &str) -> OrderMode {
    match s.to_lowercase().as_str() {
        "none" => OrderMode::None,
        "path" => OrderMode::Path,
        "similarity" => OrderMode::Similarity,
        "nilsimsa" => OrderMode::Nilsimsa(NilsimsaOptions::default()),
        _ => OrderMode::RevPath,
    }
}

fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "debug" => Level::Debug,
        "warn" => Level::Warn,
        "error" => Level::Error,
        _ => Level::Info,
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let codec = CodecKind::from_name(&cli.compression)
        .ok_or_else(|| format!("unknown codec '{}'", cli.compression))?;
    let hash_algo = match cli.file_hash.to_lowercase().as_str() {
        "none" => HashAlgo::None,
        "blake3" => HashAlgo::Blake3,
        other => return Err(format!("unknown file hash algorithm '{other}'").into()),
    };

    let filter = if cli.filter_rules.is_empty() {
        None
    } else {
        let mut f = Filter::new();
        for rule in &cli.filter_rules {
            f.add_rule(rule)?;
        }
        Some(f)
    };

    let chmod = cli
        .chmod
        .as_deref()
        .map(|spec| ChmodTransformer::parse(spec, 0o022))
        .transpose()?;

    let options = WriterOptions {
        codec,
        compression_level: cli.compression_level,
        block_size: 1u32 << cli.block_size_bits,
        window_sizes: cli.window_sizes,
        window_increment_shift: cli.window_increment_shift,
        table_bits: cli.table_bits,
        max_similarity_size: cli.max_similarity_size,
        order: parse_order(&cli.file_order),
        hash_algo,
        filter,
        chmod,
        num_workers: cli.num_workers,
        progress_level: parse_level(&cli.log_level),
    };

    let writer = Writer::new(options);
    let progress = writer.write_to_path(&cli.input, &cli.output)?;
    eprintln!("{}", progress.summary());
    let size = std::fs::metadata(&cli.output)?.len();
    println!("Created: {}  ({size} B on disk)", cli.output.display());
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mkdwarfs: {e}");
            ExitCode::from(1)
        }
    }
}

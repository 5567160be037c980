//! `dwarfsextract` — unpack a DwarFS image to a plain directory tree.
//!
//! Flag names (`--input`, `--output`, `--num-workers`, `--cache-size`,
//! `--log-level`) follow `original_source/src/dwarfsextract.cpp`'s
//! boost::program_options surface. Archive-library-based extraction formats
//! (tar, cpio) are out of scope for this crate; this tool always writes a
//! plain directory tree, the way the teacher's `Commands::Unpack` does.

use clap::Parser;
use dwarfsrs::block_cache::BlockCacheOptions;
use dwarfsrs::{Filesystem, FilesystemOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "dwarfsextract", version, about = "Extract a DwarFS image to a directory")]
struct Cli {
    /// Image to extract
    #[arg(short, long)]
    input: PathBuf,

    /// Directory to extract into; created if missing
    #[arg(short, long)]
    output: PathBuf,

    /// Number of worker threads used to decompress blocks (0 = number of CPUs)
    #[arg(short = 'n', long, default_value_t = 0)]
    num_workers: usize,

    /// Block cache size in MiB
    #[arg(short = 's', long, default_value_t = 256)]
    cache_size: u64,

    /// Log level: debug, info, warn, error (currently informational only)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn extract_dir(fs: &Filesystem, inode: u32, dest: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dest)?;
    let mut count = 0u64;
    for (name, child) in fs.readdir(inode, 0)? {
        if name == "." || name == ".." {
            continue;
        }
        let child_dest = dest.join(&name);
        let attr = fs.getattr(child)?;
        match attr.kind {
            dwarfsrs::FileKind::Directory => {
                count += extract_dir(fs, child, &child_dest)?;
            }
            dwarfsrs::FileKind::File => {
                let mut buf = vec![0u8; attr.size as usize];
                let mut offset = 0u64;
                while offset < attr.size {
                    let read = fs.read(child, offset, &mut buf[offset as usize..])?;
                    if read == 0 {
                        break;
                    }
                    offset += read as u64;
                }
                std::fs::write(&child_dest, &buf)?;
                count += 1;
            }
            dwarfsrs::FileKind::Symlink => {
                let target = fs.readlink(child)?;
                #[cfg(unix)]
                std::os::unix::fs::symlink(&target, &child_dest)?;
                #[cfg(not(unix))]
                std::fs::write(&child_dest, target.as_bytes())?;
                count += 1;
            }
            dwarfsrs::FileKind::Device => {
                // Device nodes need root and a platform mknod syscall neither
                // of which this tool assumes; skip, matching dwarfsextract's
                // own behavior when run unprivileged.
                eprintln!("skipping device node {}", child_dest.display());
            }
        }
    }
    Ok(count)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let options = FilesystemOptions {
        cache: BlockCacheOptions {
            max_bytes: cli.cache_size * 1024 * 1024,
            num_workers: cli.num_workers,
            ..BlockCacheOptions::default()
        },
        ..FilesystemOptions::default()
    };
    let fs = Filesystem::open(&cli.input, options)?;
    let count = extract_dir(&fs, fs.root_inode(), &cli.output)?;
    println!("Extracted {count} entries to {}", cli.output.display());
    let _ = cli.log_level;
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dwarfsextract: {e}");
            ExitCode::from(1)
        }
    }
}

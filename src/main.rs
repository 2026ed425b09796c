//! Mount a compressed filesystem image as a read-only filesystem.
use std::path::PathBuf;

use clap::Parser;
use tracing::error;

mod mount;
mod trc;

use crate::trc::Trc;
use gz_fs::store::{DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BLOCKS};

#[derive(Parser)]
#[command(
    version,
    about = "Read-only FUSE filesystem over a gzip-compressed image."
)]
struct Args {
    /// Path to the compressed filesystem image.
    #[arg(short, long, value_name = "IMAGE")]
    filename: PathBuf,

    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Byte offset of the filesystem within the image.
    #[arg(long)]
    offset: Option<u64>,

    /// Bytes per block of decompressed data held in the cache.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Number of blocks the cache keeps resident.
    #[arg(long, default_value_t = DEFAULT_CACHE_BLOCKS)]
    cache_blocks: usize,

    /// Let users other than the mounting one access the filesystem.
    #[arg(long)]
    allow_other: bool,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    if nix::unistd::Uid::current().is_root() || nix::unistd::Uid::effective().is_root() {
        eprintln!("Refusing to run as root: a filesystem bug would endanger the whole system.");
        std::process::exit(1);
    }

    Trc::default().init().unwrap_or_else(|e| {
        // Everything after this point reports through tracing, so a mount
        // without logging would fail silently. Bail out instead.
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    });

    if let Err(e) = mount::run(&args) {
        error!("Mount failed: {e}");
        std::process::exit(1);
    }
}

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dfs_core::{DedupFs, FsOptions};
use dfs_fuse::MountOptions;
use std::path::PathBuf;
use tracing::info;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "dfs",
    about = "dedupfs — in-memory content-addressed deduplicating filesystem"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a fresh in-memory image and mount it via FUSE.
    ///
    /// Contents vanish when the process exits.
    Mount {
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Device size in blocks of 4096 bytes, metadata included.
        #[arg(long, default_value_t = 10240)]
        blocks: u64,
        /// Inode table capacity.
        #[arg(long, default_value_t = 128)]
        inodes: u64,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
        /// Do not auto-unmount when the process exits.
        #[arg(long)]
        no_auto_unmount: bool,
    },
    /// Print the region layout a given geometry would produce.
    Layout {
        /// Device size in blocks of 4096 bytes.
        #[arg(long, default_value_t = 10240)]
        blocks: u64,
        /// Inode table capacity.
        #[arg(long, default_value_t = 128)]
        inodes: u64,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            mountpoint,
            blocks,
            inodes,
            allow_other,
            no_auto_unmount,
        } => mount_cmd(&mountpoint, blocks, inodes, allow_other, no_auto_unmount),
        Command::Layout { blocks, inodes } => layout_cmd(blocks, inodes),
    }
}

fn mount_cmd(
    mountpoint: &PathBuf,
    blocks: u64,
    inodes: u64,
    allow_other: bool,
    no_auto_unmount: bool,
) -> Result<()> {
    let opts = FsOptions {
        total_blocks: blocks,
        inodes,
    };
    let fs = DedupFs::format(&opts).context("failed to format in-memory image")?;
    let st = fs.statfs();
    info!(
        data_blocks = st.total_blocks,
        inodes = st.total_inodes,
        mountpoint = %mountpoint.display(),
        "mounting dedupfs"
    );

    let mount_opts = MountOptions {
        allow_other,
        auto_unmount: !no_auto_unmount,
    };
    dfs_fuse::mount(fs, mountpoint, &mount_opts)
        .with_context(|| format!("failed to mount at {}", mountpoint.display()))?;
    Ok(())
}

fn layout_cmd(blocks: u64, inodes: u64) -> Result<()> {
    let opts = FsOptions {
        total_blocks: blocks,
        inodes,
    };
    let fs = DedupFs::format(&opts).context("geometry does not fit")?;
    let st = fs.statfs();
    println!("dedupfs layout");
    println!("block_size: {}", st.block_size);
    println!("device_blocks: {blocks}");
    println!("inode_table: {inodes} inodes");
    println!("data_blocks: {}", st.total_blocks);
    println!(
        "metadata_blocks: {}",
        blocks - st.total_blocks
    );
    println!("name_max: {}", st.name_max);
    Ok(())
}

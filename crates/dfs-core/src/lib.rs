#![forbid(unsafe_code)]
//! dedupfs core: an in-memory, content-addressed deduplicating filesystem.
//!
//! One contiguous byte region acts as the block device. Within it live a
//! superblock, an inode table, a block-management table (content digest,
//! refcount, and BST links per physical block), and a pool of data blocks.
//! Every write is hashed; matching content bumps a reference count instead
//! of allocating, so each distinct block is stored once no matter how many
//! files — or directories — contain it.
//!
//! The host-facing surface is [`DedupFs`], keyed by UTF-8 paths. The model
//! is single-threaded run-to-completion: wrap the handle in one mutex when
//! driving it from a multi-threaded host.

pub mod alloc;
pub mod blockmap;
pub mod dedup;
pub mod device;
pub mod dir;
pub mod fs;
pub mod fsck;
pub mod index;
pub mod inode;
pub mod path;
pub mod superblock;

pub use fs::{AccessMode, Attr, DedupFs, FileKind, FsOptions, StatFs};
pub use fsck::{check, FsckReport};
pub use superblock::Superblock;

pub use dfs_error::{DfsError, Result};
pub use dfs_types::{BlockDigest, InodeNr, PhysBlock, BLOCK_SIZE, NAME_MAX};

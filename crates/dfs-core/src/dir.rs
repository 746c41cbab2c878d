//! Directory contents.
//!
//! A directory's data blocks hold a packed sequence of 8-byte child inode
//! numbers; the inode's `size` counts entries. Blocks are read and written
//! through the dedup layer, so directories with identical contents share
//! physical storage like any other blocks.

use crate::blockmap;
use crate::dedup;
use crate::device::{Device, SLOTS_PER_BLOCK};
use crate::inode::{Inode, InodeKind};
use crate::superblock::Superblock;
use dfs_error::{DfsError, Result};
use dfs_types::{read_u64, write_u64, InodeNr, BLOCK_SIZE};

/// Child entries per directory block.
pub const ENTRIES_PER_BLOCK: usize = SLOTS_PER_BLOCK;

fn blocks_for_entries(entries: u64) -> u64 {
    (entries * 8).div_ceil(BLOCK_SIZE as u64)
}

/// Child inode number at position `i` (directory-insertion order).
#[must_use]
pub fn child_at(dev: &Device, dir: &Inode, i: u64) -> InodeNr {
    debug_assert_eq!(dir.kind, InodeKind::Directory);
    debug_assert!(i < dir.size);
    let epb = ENTRIES_PER_BLOCK as u64;
    let mut buf = [0_u8; BLOCK_SIZE];
    dedup::read(dev, dir, i / epb, &mut buf);
    InodeNr(read_u64(&buf, usize::try_from(i % epb).expect("slot index") * 8))
}

/// Append `child` to the directory. The caller persists the updated inode.
pub fn add_child(
    dev: &mut Device,
    sb: &mut Superblock,
    dir: &mut Inode,
    child: InodeNr,
) -> Result<()> {
    debug_assert_eq!(dir.kind, InodeKind::Directory);
    let i = dir.size;
    let epb = ENTRIES_PER_BLOCK as u64;
    blockmap::resize(dev, sb, dir, blocks_for_entries(i + 1))?;

    let mut buf = [0_u8; BLOCK_SIZE];
    dedup::read(dev, dir, i / epb, &mut buf);
    write_u64(
        &mut buf,
        usize::try_from(i % epb).expect("slot index") * 8,
        child.0,
    );
    if let Err(err) = dedup::write(dev, sb, dir, i / epb, &buf) {
        blockmap::resize(dev, sb, dir, blocks_for_entries(i))?;
        return Err(err);
    }
    dir.size = i + 1;
    Ok(())
}

/// Remove `child` from the directory, shifting the remaining entries down to
/// keep insertion order dense. The caller persists the updated inode.
pub fn remove_child(
    dev: &mut Device,
    sb: &mut Superblock,
    dir: &mut Inode,
    child: InodeNr,
) -> Result<()> {
    debug_assert_eq!(dir.kind, InodeKind::Directory);
    let total = dir.size;
    let idx = (0..total)
        .find(|i| child_at(dev, dir, *i) == child)
        .ok_or_else(|| {
            DfsError::Internal(format!("inode {child} not a child of directory {}", dir.name))
        })?;

    let epb = ENTRIES_PER_BLOCK as u64;
    let first_block = idx / epb;
    let last_block = (total - 1) / epb;
    let mut buf = [0_u8; BLOCK_SIZE];
    for b in first_block..=last_block {
        dedup::read(dev, dir, b, &mut buf);
        let start = if b == first_block {
            usize::try_from(idx % epb).expect("slot index")
        } else {
            0
        };
        let end = if b == last_block {
            usize::try_from((total - 1) % epb).expect("slot index")
        } else {
            ENTRIES_PER_BLOCK - 1
        };
        for k in start..end {
            let next = read_u64(&buf, (k + 1) * 8);
            write_u64(&mut buf, k * 8, next);
        }
        if b < last_block {
            let carried = child_at(dev, dir, (b + 1) * epb);
            write_u64(&mut buf, (ENTRIES_PER_BLOCK - 1) * 8, carried.0);
        } else {
            // The vacated tail slot is zeroed so directories with identical
            // contents stay byte-identical.
            write_u64(&mut buf, end * 8, 0);
        }
        dedup::write(dev, sb, dir, b, &buf)?;
    }

    dir.size = total - 1;
    blockmap::resize(dev, sb, dir, blocks_for_entries(dir.size))?;
    Ok(())
}

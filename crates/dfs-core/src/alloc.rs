//! Data-block allocator.
//!
//! A singly linked freelist threaded through the free blocks themselves:
//! the head lives in the superblock and each free block stores its successor
//! in its first 8 bytes. Allocation and release are LIFO; there is no
//! coalescing.

use crate::device::Device;
use crate::superblock::Superblock;
use dfs_error::{DfsError, Result};
use dfs_types::PhysBlock;
use tracing::trace;

/// Pop the freelist head.
///
/// The returned block's contents are undefined; callers must overwrite it in
/// full before exposing it through any index.
pub fn alloc(dev: &mut Device, sb: &mut Superblock) -> Result<PhysBlock> {
    if sb.freelist == 0 {
        return Err(DfsError::NoSpace);
    }
    let head = PhysBlock(sb.freelist);
    sb.freelist = dev.read_u64_slot(head, 0);
    sb.n_block_used += 1;
    trace!(target: "dfs::alloc", block = head.0, used = sb.n_block_used, "alloc");
    Ok(head)
}

/// Push `phys` back onto the freelist.
pub fn free(dev: &mut Device, sb: &mut Superblock, phys: PhysBlock) {
    debug_assert!(sb.in_data_region(phys), "freeing block {phys} outside data region");
    dev.write_u64_slot(phys, 0, sb.freelist);
    sb.freelist = phys.0;
    sb.n_block_used -= 1;
    trace!(target: "dfs::alloc", block = phys.0, used = sb.n_block_used, "free");
}

/// Thread the freelist through every data block in ascending order.
/// Called once at format time.
pub fn format_freelist(dev: &mut Device, sb: &mut Superblock) {
    let first = sb.ptr_block;
    for k in 0..sb.n_blocks {
        let next = if k + 1 == sb.n_blocks { 0 } else { first + k + 1 };
        dev.write_u64_slot(PhysBlock(first + k), 0, next);
    }
    sb.freelist = first;
    sb.n_block_used = 0;
}

//! Superblock: region layout, counters, and structure roots.
//!
//! Lives at physical block 0. The in-memory copy is authoritative during an
//! operation; the facade stores it back to block 0 after every mutation so
//! the raw image stays inspectable.

use crate::device::Device;
use crate::index::MGT_ENTRY_SIZE;
use crate::inode::INODE_SIZE;
use dfs_error::{DfsError, Result};
use dfs_types::{read_u64, write_u64, InodeNr, PhysBlock, BLOCK_SIZE};

/// The block holding the superblock.
pub const SUPERBLOCK_BLOCK: PhysBlock = PhysBlock(0);

// Field offsets within block 0, one u64 each.
const OFF_PTR_INODE: usize = 0;
const OFF_PTR_BLOCK_MGT: usize = 8;
const OFF_PTR_BLOCK: usize = 16;
const OFF_N_INODES: usize = 24;
const OFF_N_INODE_USED: usize = 32;
const OFF_N_BLOCKS: usize = 40;
const OFF_N_BLOCK_USED: usize = 48;
const OFF_FREELIST: usize = 56;
const OFF_INDEX_ROOT: usize = 64;
const OFF_ROOT_INO: usize = 72;

/// Region offsets, counters, and roots.
///
/// `n_blocks`/`n_block_used` count data-region blocks only; the superblock,
/// inode table, and block-management table are outside both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// First block of the inode table.
    pub ptr_inode: u64,
    /// First block of the block-management table.
    pub ptr_block_mgt: u64,
    /// First block of the data region.
    pub ptr_block: u64,
    /// Total inodes in the table.
    pub n_inodes: u64,
    /// Inodes whose type is not Unused.
    pub n_inode_used: u64,
    /// Total data blocks.
    pub n_blocks: u64,
    /// Data blocks not on the freelist.
    pub n_block_used: u64,
    /// Head of the data-block freelist; 0 = empty.
    pub freelist: u64,
    /// Root of the block-index BST; 0 = empty.
    pub index_root: u64,
    /// The root directory's inode number.
    pub root_ino: InodeNr,
}

impl Superblock {
    /// Compute the region layout for a device of `total_blocks` blocks with
    /// an inode table of `n_inodes` entries.
    ///
    /// Region order in blocks: superblock, inode table, block-management
    /// table, data. Fails if nothing is left for data.
    pub fn layout(total_blocks: u64, n_inodes: u64) -> Result<Self> {
        if n_inodes == 0 {
            return Err(DfsError::Internal("inode count must be non-zero".into()));
        }
        let inode_blocks = (n_inodes * INODE_SIZE as u64).div_ceil(BLOCK_SIZE as u64);
        let mgt_blocks = (total_blocks * MGT_ENTRY_SIZE as u64).div_ceil(BLOCK_SIZE as u64);
        let ptr_inode = 1;
        let ptr_block_mgt = ptr_inode + inode_blocks;
        let ptr_block = ptr_block_mgt + mgt_blocks;
        if ptr_block >= total_blocks {
            return Err(DfsError::Internal(format!(
                "device of {total_blocks} blocks too small for metadata ({ptr_block} blocks)"
            )));
        }
        Ok(Self {
            ptr_inode,
            ptr_block_mgt,
            ptr_block,
            n_inodes,
            n_inode_used: 0,
            n_blocks: total_blocks - ptr_block,
            n_block_used: 0,
            freelist: 0,
            index_root: 0,
            root_ino: InodeNr::ROOT,
        })
    }

    /// Serialize to block 0.
    pub fn store(&self, dev: &mut Device) {
        let block = dev.block_mut(SUPERBLOCK_BLOCK);
        write_u64(block, OFF_PTR_INODE, self.ptr_inode);
        write_u64(block, OFF_PTR_BLOCK_MGT, self.ptr_block_mgt);
        write_u64(block, OFF_PTR_BLOCK, self.ptr_block);
        write_u64(block, OFF_N_INODES, self.n_inodes);
        write_u64(block, OFF_N_INODE_USED, self.n_inode_used);
        write_u64(block, OFF_N_BLOCKS, self.n_blocks);
        write_u64(block, OFF_N_BLOCK_USED, self.n_block_used);
        write_u64(block, OFF_FREELIST, self.freelist);
        write_u64(block, OFF_INDEX_ROOT, self.index_root);
        write_u64(block, OFF_ROOT_INO, self.root_ino.0);
    }

    /// Deserialize from block 0.
    #[must_use]
    pub fn load(dev: &Device) -> Self {
        let block = dev.block(SUPERBLOCK_BLOCK);
        Self {
            ptr_inode: read_u64(block, OFF_PTR_INODE),
            ptr_block_mgt: read_u64(block, OFF_PTR_BLOCK_MGT),
            ptr_block: read_u64(block, OFF_PTR_BLOCK),
            n_inodes: read_u64(block, OFF_N_INODES),
            n_inode_used: read_u64(block, OFF_N_INODE_USED),
            n_blocks: read_u64(block, OFF_N_BLOCKS),
            n_block_used: read_u64(block, OFF_N_BLOCK_USED),
            freelist: read_u64(block, OFF_FREELIST),
            index_root: read_u64(block, OFF_INDEX_ROOT),
            root_ino: InodeNr(read_u64(block, OFF_ROOT_INO)),
        }
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.n_blocks - self.n_block_used
    }

    #[must_use]
    pub fn free_inodes(&self) -> u64 {
        self.n_inodes - self.n_inode_used
    }

    /// Whether `phys` lies in the data region.
    #[must_use]
    pub fn in_data_region(&self, phys: PhysBlock) -> bool {
        phys.0 >= self.ptr_block && phys.0 < self.ptr_block + self.n_blocks
    }
}

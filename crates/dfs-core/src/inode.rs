//! Inode records and the inode table.
//!
//! Files and directories share one fixed-size record: attributes, a
//! NUL-terminated name (the entry name under the parent directory), and the
//! block-pointer array. Records are 512 bytes, eight per block, stored in
//! the inode region right after the superblock.

use crate::device::Device;
use crate::superblock::Superblock;
use dfs_error::{DfsError, Result};
use dfs_types::{read_u64, trim_nul, write_u64, InodeNr, PhysBlock, BLOCK_SIZE, NAME_MAX};

/// On-device size of one inode record.
pub const INODE_SIZE: usize = 512;

/// Inode records per block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Length of the block-pointer array. Slots `0..INODE_SLOTS-1` are direct;
/// the last slot heads the indirect chain.
pub const INODE_SLOTS: usize = 16;

// Record layout: attributes at 0 (padded to 128), name at 128 (256 bytes
// including the terminator), block pointers at 384.
const OFF_TYPE: usize = 0;
const OFF_MODE: usize = 8;
const OFF_ATIME: usize = 16;
const OFF_MTIME: usize = 24;
const OFF_CTIME: usize = 32;
const OFF_SIZE: usize = 40;
const OFF_N_BLOCKS: usize = 48;
const OFF_NAME: usize = 128;
const OFF_BLOCKS: usize = 384;

/// What an inode record currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Unused,
    File,
    Directory,
}

impl InodeKind {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => Self::File,
            2 => Self::Directory,
            _ => {
                debug_assert!(raw == 0, "unknown inode type {raw}");
                Self::Unused
            }
        }
    }

    fn to_raw(self) -> u64 {
        match self {
            Self::Unused => 0,
            Self::File => 1,
            Self::Directory => 2,
        }
    }
}

/// In-memory copy of one inode record.
///
/// `size` is bytes for files and the child-entry count for directories.
/// `n_blocks` counts the logical slots currently in the block map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub kind: InodeKind,
    pub mode: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub size: u64,
    pub n_blocks: u64,
    pub name: String,
    pub blocks: [u64; INODE_SLOTS],
}

impl Inode {
    /// An unused record (what a freshly formatted table is full of).
    #[must_use]
    pub fn unused() -> Self {
        Self {
            kind: InodeKind::Unused,
            mode: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            size: 0,
            n_blocks: 0,
            name: String::new(),
            blocks: [0; INODE_SLOTS],
        }
    }

    /// A fresh record of the given kind, with all timestamps set to `now`.
    #[must_use]
    pub fn new(kind: InodeKind, name: &str, mode: u32, now: u64) -> Self {
        debug_assert!(name.len() <= NAME_MAX);
        Self {
            kind,
            mode,
            atime: now,
            mtime: now,
            ctime: now,
            size: 0,
            n_blocks: 0,
            name: name.to_owned(),
            blocks: [0; INODE_SLOTS],
        }
    }

    fn parse(raw: &[u8]) -> Self {
        let mut blocks = [0_u64; INODE_SLOTS];
        for (i, slot) in blocks.iter_mut().enumerate() {
            *slot = read_u64(raw, OFF_BLOCKS + i * 8);
        }
        Self {
            kind: InodeKind::from_raw(read_u64(raw, OFF_TYPE)),
            mode: u32::try_from(read_u64(raw, OFF_MODE) & 0xFFFF_FFFF).unwrap_or(0),
            atime: read_u64(raw, OFF_ATIME),
            mtime: read_u64(raw, OFF_MTIME),
            ctime: read_u64(raw, OFF_CTIME),
            size: read_u64(raw, OFF_SIZE),
            n_blocks: read_u64(raw, OFF_N_BLOCKS),
            name: trim_nul(&raw[OFF_NAME..OFF_NAME + NAME_MAX + 1]),
            blocks,
        }
    }

    fn serialize(&self, raw: &mut [u8]) {
        debug_assert_eq!(raw.len(), INODE_SIZE);
        raw.fill(0);
        write_u64(raw, OFF_TYPE, self.kind.to_raw());
        write_u64(raw, OFF_MODE, u64::from(self.mode));
        write_u64(raw, OFF_ATIME, self.atime);
        write_u64(raw, OFF_MTIME, self.mtime);
        write_u64(raw, OFF_CTIME, self.ctime);
        write_u64(raw, OFF_SIZE, self.size);
        write_u64(raw, OFF_N_BLOCKS, self.n_blocks);
        let name = self.name.as_bytes();
        debug_assert!(name.len() <= NAME_MAX);
        raw[OFF_NAME..OFF_NAME + name.len()].copy_from_slice(name);
        for (i, slot) in self.blocks.iter().enumerate() {
            write_u64(raw, OFF_BLOCKS + i * 8, *slot);
        }
    }
}

/// On-device location of inode `nr`.
fn location(sb: &Superblock, nr: InodeNr) -> (PhysBlock, usize) {
    assert!(nr.0 < sb.n_inodes, "inode {} out of range", nr.0);
    let idx = usize::try_from(nr.0).expect("inode number fits usize");
    let block = sb.ptr_inode + (idx / INODES_PER_BLOCK) as u64;
    (PhysBlock(block), (idx % INODES_PER_BLOCK) * INODE_SIZE)
}

/// Read inode `nr` from the table.
#[must_use]
pub fn read(dev: &Device, sb: &Superblock, nr: InodeNr) -> Inode {
    let (block, off) = location(sb, nr);
    Inode::parse(&dev.block(block)[off..off + INODE_SIZE])
}

/// Write inode `nr` back to the table.
pub fn write(dev: &mut Device, sb: &Superblock, nr: InodeNr, inode: &Inode) {
    let (block, off) = location(sb, nr);
    inode.serialize(&mut dev.block_mut(block)[off..off + INODE_SIZE]);
}

/// Linear scan for an unused record.
pub fn find_free(dev: &Device, sb: &Superblock) -> Result<InodeNr> {
    for nr in 0..sb.n_inodes {
        if read(dev, sb, InodeNr(nr)).kind == InodeKind::Unused {
            return Ok(InodeNr(nr));
        }
    }
    Err(DfsError::NoInode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> (Device, Superblock) {
        let dev = Device::new(256);
        let sb = Superblock::layout(256, 16).unwrap();
        (dev, sb)
    }

    #[test]
    fn record_size_divides_block() {
        assert_eq!(BLOCK_SIZE % INODE_SIZE, 0);
        assert_eq!(INODES_PER_BLOCK, 8);
    }

    #[test]
    fn serialize_parse_round_trip() {
        let mut inode = Inode::new(InodeKind::File, "hello.txt", 0o644, 1_700_000_000);
        inode.size = 12345;
        inode.n_blocks = 4;
        inode.blocks[0] = 200;
        inode.blocks[INODE_SLOTS - 1] = 201;

        let mut raw = vec![0_u8; INODE_SIZE];
        inode.serialize(&mut raw);
        assert_eq!(Inode::parse(&raw), inode);
    }

    #[test]
    fn table_read_write() {
        let (mut dev, sb) = test_env();
        let inode = Inode::new(InodeKind::Directory, "d", 0o755, 42);
        write(&mut dev, &sb, InodeNr(5), &inode);
        assert_eq!(read(&dev, &sb, InodeNr(5)), inode);
        // Neighbors untouched.
        assert_eq!(read(&dev, &sb, InodeNr(4)).kind, InodeKind::Unused);
        assert_eq!(read(&dev, &sb, InodeNr(6)).kind, InodeKind::Unused);
    }

    #[test]
    fn find_free_skips_used() {
        let (mut dev, sb) = test_env();
        write(
            &mut dev,
            &sb,
            InodeNr(0),
            &Inode::new(InodeKind::Directory, "", 0o777, 0),
        );
        write(
            &mut dev,
            &sb,
            InodeNr(1),
            &Inode::new(InodeKind::File, "a", 0o644, 0),
        );
        assert_eq!(find_free(&dev, &sb).unwrap(), InodeNr(2));
    }

    #[test]
    fn find_free_exhausted() {
        let (mut dev, sb) = test_env();
        for nr in 0..sb.n_inodes {
            write(
                &mut dev,
                &sb,
                InodeNr(nr),
                &Inode::new(InodeKind::File, "x", 0o644, 0),
            );
        }
        assert!(matches!(find_free(&dev, &sb), Err(DfsError::NoInode)));
    }

    #[test]
    fn name_preserves_max_length() {
        let long = "n".repeat(NAME_MAX);
        let inode = Inode::new(InodeKind::File, &long, 0o644, 0);
        let mut raw = vec![0_u8; INODE_SIZE];
        inode.serialize(&mut raw);
        assert_eq!(Inode::parse(&raw).name, long);
    }
}

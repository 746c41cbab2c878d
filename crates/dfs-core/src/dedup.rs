//! Deduplicating block I/O.
//!
//! Writes are keyed by content digest: matching content bumps the existing
//! block's reference count instead of allocating, and updating a shared
//! block naturally lands on a new physical block — content addressing is
//! the copy-on-write path.

use crate::alloc;
use crate::blockmap;
use crate::device::Device;
use crate::index::{self, MgtEntry};
use crate::inode::Inode;
use crate::superblock::Superblock;
use dfs_error::{DfsError, Result};
use dfs_types::{BlockDigest, PhysBlock, BLOCK_SIZE};
use tracing::trace;

/// Content digest of one full block.
#[must_use]
pub fn digest_block(data: &[u8]) -> BlockDigest {
    debug_assert_eq!(data.len(), BLOCK_SIZE);
    BlockDigest(*blake3::hash(data).as_bytes())
}

/// Read logical block `pos` of `inode` into `out`. Unmapped slots read as
/// zeros.
pub fn read(dev: &Device, inode: &Inode, pos: u64, out: &mut [u8]) {
    debug_assert_eq!(out.len(), BLOCK_SIZE);
    let phys = blockmap::resolve(dev, inode, pos);
    if phys.is_null() {
        out.fill(0);
    } else {
        out.copy_from_slice(dev.block(phys));
    }
}

/// Write `data` as logical block `pos` of `inode`, deduplicating by digest.
///
/// The slot must already exist in the block map (grow first). A digest
/// collision between distinct contents is surfaced as `NoSpace` — the write
/// is refused rather than silently not deduplicated.
pub fn write(
    dev: &mut Device,
    sb: &mut Superblock,
    inode: &mut Inode,
    pos: u64,
    data: &[u8],
) -> Result<()> {
    debug_assert_eq!(data.len(), BLOCK_SIZE);
    let digest = digest_block(data);
    let cur = blockmap::resolve(dev, inode, pos);

    if let Some(existing) = index::search(dev, sb, &digest) {
        if existing == cur {
            return Ok(());
        }
        if !cur.is_null() {
            unref(dev, sb, cur)?;
        }
        let mut entry = index::read_entry(dev, sb, existing);
        entry.refs += 1;
        index::write_entry(dev, sb, existing, &entry);
        blockmap::update(dev, inode, pos, existing);
        trace!(target: "dfs::dedup", block = existing.0, refs = entry.refs, "dedup hit");
        return Ok(());
    }

    let fresh = store_new_block(dev, sb, digest, data)?;
    if !cur.is_null() {
        unref(dev, sb, cur)?;
    }
    blockmap::update(dev, inode, pos, fresh);
    trace!(target: "dfs::dedup", block = fresh.0, "stored new block");
    Ok(())
}

/// Store `data` in a freshly allocated block and link it into the index
/// under `digest`.
///
/// A digest collision with an already-indexed block releases the
/// allocation and refuses the write with `NoSpace` (the strict variant:
/// no second physical copy is kept).
fn store_new_block(
    dev: &mut Device,
    sb: &mut Superblock,
    digest: BlockDigest,
    data: &[u8],
) -> Result<PhysBlock> {
    let fresh = alloc::alloc(dev, sb)?;
    dev.write_block(fresh, data);
    index::write_entry(dev, sb, fresh, &MgtEntry::new(digest));
    if let Err(err) = index::insert(dev, sb, fresh) {
        alloc::free(dev, sb, fresh);
        return Err(match err {
            DfsError::DigestCollision => DfsError::NoSpace,
            other => other,
        });
    }
    Ok(fresh)
}

/// Drop one reference to `phys`; at zero the block leaves the index and
/// returns to the freelist.
pub fn unref(dev: &mut Device, sb: &mut Superblock, phys: PhysBlock) -> Result<()> {
    let mut entry = index::read_entry(dev, sb, phys);
    debug_assert!(entry.refs > 0, "unref of unreferenced block {phys}");
    entry.refs -= 1;
    index::write_entry(dev, sb, phys, &entry);
    if entry.refs == 0 {
        index::remove(dev, sb, phys)?;
        alloc::free(dev, sb, phys);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::format_freelist;
    use crate::inode::InodeKind;

    fn test_env() -> (Device, Superblock) {
        let mut dev = Device::new(1024);
        let mut sb = Superblock::layout(1024, 16).unwrap();
        format_freelist(&mut dev, &mut sb);
        (dev, sb)
    }

    fn file_with_blocks(dev: &mut Device, sb: &mut Superblock, n: u64) -> Inode {
        let mut inode = Inode::new(InodeKind::File, "f", 0o644, 0);
        blockmap::grow(dev, sb, &mut inode, n).unwrap();
        inode
    }

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn unmapped_slot_reads_zeros() {
        let (mut dev, mut sb) = test_env();
        let inode = file_with_blocks(&mut dev, &mut sb, 1);
        let mut out = [0xFF_u8; BLOCK_SIZE];
        read(&dev, &inode, 0, &mut out);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn write_then_read_round_trip() {
        let (mut dev, mut sb) = test_env();
        let mut inode = file_with_blocks(&mut dev, &mut sb, 1);
        let data = block_of(0x5A);
        write(&mut dev, &mut sb, &mut inode, 0, &data).unwrap();

        let mut out = [0_u8; BLOCK_SIZE];
        read(&dev, &inode, 0, &mut out);
        assert_eq!(&out[..], &data[..]);
        assert_eq!(sb.n_block_used, 1);
    }

    #[test]
    fn identical_content_shares_one_block() {
        let (mut dev, mut sb) = test_env();
        let mut a = file_with_blocks(&mut dev, &mut sb, 1);
        let mut b = file_with_blocks(&mut dev, &mut sb, 1);
        let data = block_of(0x11);

        write(&mut dev, &mut sb, &mut a, 0, &data).unwrap();
        write(&mut dev, &mut sb, &mut b, 0, &data).unwrap();

        assert_eq!(sb.n_block_used, 1);
        let phys = blockmap::resolve(&dev, &a, 0);
        assert_eq!(blockmap::resolve(&dev, &b, 0), phys);
        assert_eq!(index::read_entry(&dev, &sb, phys).refs, 2);
    }

    #[test]
    fn overwrite_with_same_content_is_a_noop() {
        let (mut dev, mut sb) = test_env();
        let mut inode = file_with_blocks(&mut dev, &mut sb, 1);
        let data = block_of(0x22);
        write(&mut dev, &mut sb, &mut inode, 0, &data).unwrap();
        let phys = blockmap::resolve(&dev, &inode, 0);

        write(&mut dev, &mut sb, &mut inode, 0, &data).unwrap();
        assert_eq!(blockmap::resolve(&dev, &inode, 0), phys);
        assert_eq!(sb.n_block_used, 1);
        assert_eq!(index::read_entry(&dev, &sb, phys).refs, 1);
    }

    #[test]
    fn updating_a_shared_block_copies_on_write() {
        let (mut dev, mut sb) = test_env();
        let mut a = file_with_blocks(&mut dev, &mut sb, 1);
        let mut b = file_with_blocks(&mut dev, &mut sb, 1);
        let shared = block_of(0x33);
        write(&mut dev, &mut sb, &mut a, 0, &shared).unwrap();
        write(&mut dev, &mut sb, &mut b, 0, &shared).unwrap();
        let old = blockmap::resolve(&dev, &a, 0);

        // Rewriting one file must leave the other's content intact.
        write(&mut dev, &mut sb, &mut a, 0, &block_of(0x44)).unwrap();
        assert_ne!(blockmap::resolve(&dev, &a, 0), old);
        assert_eq!(blockmap::resolve(&dev, &b, 0), old);
        assert_eq!(index::read_entry(&dev, &sb, old).refs, 1);
        assert_eq!(sb.n_block_used, 2);

        let mut out = [0_u8; BLOCK_SIZE];
        read(&dev, &b, 0, &mut out);
        assert_eq!(&out[..], &shared[..]);
    }

    #[test]
    fn rewriting_to_existing_content_rejoins_the_shared_block() {
        let (mut dev, mut sb) = test_env();
        let mut a = file_with_blocks(&mut dev, &mut sb, 1);
        let mut b = file_with_blocks(&mut dev, &mut sb, 1);
        write(&mut dev, &mut sb, &mut a, 0, &block_of(0x55)).unwrap();
        write(&mut dev, &mut sb, &mut b, 0, &block_of(0x66)).unwrap();
        assert_eq!(sb.n_block_used, 2);

        // b now matches a: b's old block must be released.
        write(&mut dev, &mut sb, &mut b, 0, &block_of(0x55)).unwrap();
        assert_eq!(sb.n_block_used, 1);
        assert_eq!(
            blockmap::resolve(&dev, &a, 0),
            blockmap::resolve(&dev, &b, 0)
        );
    }

    #[test]
    fn last_unref_frees_the_block() {
        let (mut dev, mut sb) = test_env();
        let mut a = file_with_blocks(&mut dev, &mut sb, 1);
        let mut b = file_with_blocks(&mut dev, &mut sb, 1);
        let data = block_of(0x77);
        write(&mut dev, &mut sb, &mut a, 0, &data).unwrap();
        write(&mut dev, &mut sb, &mut b, 0, &data).unwrap();
        let phys = blockmap::resolve(&dev, &a, 0);

        unref(&mut dev, &mut sb, phys).unwrap();
        assert_eq!(sb.n_block_used, 1);
        assert_eq!(index::search(&dev, &sb, &digest_block(&data)), Some(phys));

        unref(&mut dev, &mut sb, phys).unwrap();
        assert_eq!(sb.n_block_used, 0);
        assert_eq!(index::search(&dev, &sb, &digest_block(&data)), None);
    }

    #[test]
    fn collision_on_store_releases_the_allocation() {
        let (mut dev, mut sb) = test_env();
        let data = block_of(0x88);
        let digest = digest_block(&data);

        // Seed a decoy whose indexed digest matches data's digest but whose
        // content differs — the collision the index must refuse.
        let decoy = alloc::alloc(&mut dev, &mut sb).unwrap();
        dev.write_block(decoy, &block_of(0x99));
        index::write_entry(&mut dev, &sb, decoy, &MgtEntry::new(digest));
        index::insert(&mut dev, &mut sb, decoy).unwrap();

        let used_before = sb.n_block_used;
        let free_before = sb.free_blocks();
        let err = store_new_block(&mut dev, &mut sb, digest, &data).unwrap_err();
        assert!(matches!(err, DfsError::NoSpace));

        // The speculative allocation came back; the decoy keeps the digest.
        assert_eq!(sb.n_block_used, used_before);
        assert_eq!(sb.free_blocks(), free_before);
        assert_eq!(index::search(&dev, &sb, &digest), Some(decoy));
    }

    #[test]
    fn exhaustion_propagates_no_space() {
        let mut dev = Device::new(256);
        let mut sb = Superblock::layout(256, 16).unwrap();
        format_freelist(&mut dev, &mut sb);
        let total = sb.n_blocks;
        let mut inode = file_with_blocks(&mut dev, &mut sb, 1);

        let mut held = Vec::new();
        for _ in 0..total {
            held.push(alloc::alloc(&mut dev, &mut sb).unwrap());
        }
        let err = write(&mut dev, &mut sb, &mut inode, 0, &block_of(1)).unwrap_err();
        assert!(matches!(err, DfsError::NoSpace));
        assert!(blockmap::resolve(&dev, &inode, 0).is_null());
    }
}

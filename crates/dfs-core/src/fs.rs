//! The filesystem facade: the path-keyed operation surface consumed by the
//! FUSE adapter (and by tests directly).
//!
//! One `DedupFs` owns the whole backing region for the process lifetime.
//! Operations run to completion on the calling thread; there is no internal
//! locking — a multi-threaded host wraps the handle in a single mutex.

use crate::alloc;
use crate::blockmap;
use crate::dedup;
use crate::device::Device;
use crate::inode::{self, Inode, InodeKind};
use crate::path;
use crate::superblock::Superblock;
use dfs_error::{DfsError, Result};
use dfs_types::{blocks_for_bytes, InodeNr, BLOCK_SIZE, NAME_MAX};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Formatting parameters for a fresh in-memory image.
#[derive(Debug, Clone, Copy)]
pub struct FsOptions {
    /// Total device size in blocks, metadata included.
    pub total_blocks: u64,
    /// Inode table capacity.
    pub inodes: u64,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            total_blocks: 10240,
            inodes: 128,
        }
    }
}

/// What kind of entry an inode holds, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Attributes returned by [`DedupFs::getattr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: InodeNr,
    pub kind: FileKind,
    pub mode: u32,
    /// Bytes for files; child-entry count for directories.
    pub size: u64,
    pub n_blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u32,
}

/// Filesystem-wide statistics for statfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub name_max: u32,
}

/// Access mode carried from open to read/write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// The in-memory deduplicating filesystem.
#[derive(Debug)]
pub struct DedupFs {
    pub(crate) dev: Device,
    pub(crate) sb: Superblock,
}

impl DedupFs {
    /// Lay out and format a fresh image: regions, freelist, root directory.
    pub fn format(opts: &FsOptions) -> Result<Self> {
        let mut dev = Device::new(opts.total_blocks);
        let mut sb = Superblock::layout(opts.total_blocks, opts.inodes)?;
        // The region is freshly zeroed: every inode is Unused and every
        // management entry carries a zero refcount already.
        alloc::format_freelist(&mut dev, &mut sb);
        inode::write(
            &mut dev,
            &sb,
            sb.root_ino,
            &Inode::new(InodeKind::Directory, "", 0o777, now_secs()),
        );
        sb.n_inode_used = 1;
        sb.store(&mut dev);
        info!(
            target: "dfs::fs",
            total_blocks = opts.total_blocks,
            data_blocks = sb.n_blocks,
            inodes = opts.inodes,
            "formatted in-memory image"
        );
        Ok(Self { dev, sb })
    }

    /// Persist the superblock into block 0 of the image.
    fn commit(&mut self) {
        self.sb.store(&mut self.dev);
    }

    fn load_inode(&self, path: &str) -> Result<(InodeNr, Inode)> {
        let nr = path::resolve(&self.dev, &self.sb, path)?;
        Ok((nr, inode::read(&self.dev, &self.sb, nr)))
    }

    // ── Attributes and directory listing ────────────────────────────────

    pub fn getattr(&self, path: &str) -> Result<Attr> {
        let (nr, node) = self.load_inode(path)?;
        Ok(attr_of(nr, &node))
    }

    /// Entry names: ".", "..", then children in insertion order.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let (_, node) = self.load_inode(path)?;
        if node.kind != InodeKind::Directory {
            return Err(DfsError::NotDirectory);
        }
        let mut names = Vec::with_capacity(usize::try_from(node.size).unwrap_or(2) + 2);
        names.push(".".to_owned());
        names.push("..".to_owned());
        for i in 0..node.size {
            let child = crate::dir::child_at(&self.dev, &node, i);
            names.push(inode::read(&self.dev, &self.sb, child).name);
        }
        Ok(names)
    }

    #[must_use]
    pub fn statfs(&self) -> StatFs {
        StatFs {
            block_size: BLOCK_SIZE as u32,
            total_blocks: self.sb.n_blocks,
            free_blocks: self.sb.free_blocks(),
            total_inodes: self.sb.n_inodes,
            free_inodes: self.sb.free_inodes(),
            name_max: NAME_MAX as u32,
        }
    }

    // ── Open / read / write ─────────────────────────────────────────────

    /// Validate that `path` exists. Handles are stateless; the host passes
    /// the access mode back into read and write.
    pub fn open(&self, path: &str) -> Result<Attr> {
        self.getattr(path)
    }

    /// Read up to `size` bytes at `offset`. Short near EOF; empty past it.
    pub fn read(&self, path: &str, offset: u64, size: u32, mode: AccessMode) -> Result<Vec<u8>> {
        let (_, node) = self.load_inode(path)?;
        if node.kind == InodeKind::Directory {
            return Err(DfsError::IsDirectory);
        }
        if !mode.can_read() {
            return Err(DfsError::PermissionDenied);
        }
        if offset >= node.size {
            return Ok(Vec::new());
        }
        let len = usize::try_from((node.size - offset).min(u64::from(size)))
            .expect("read length fits usize");
        let mut out = vec![0_u8; len];
        let mut done = 0;
        let mut buf = [0_u8; BLOCK_SIZE];
        while done < len {
            let abs = offset + done as u64;
            let pos = abs / BLOCK_SIZE as u64;
            let within = usize::try_from(abs % BLOCK_SIZE as u64).expect("offset fits usize");
            let chunk = (BLOCK_SIZE - within).min(len - done);
            dedup::read(&self.dev, &node, pos, &mut buf);
            out[done..done + chunk].copy_from_slice(&buf[within..within + chunk]);
            done += chunk;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, extending the file as needed. Returns the
    /// number of bytes written (short only when space runs out mid-write).
    pub fn write(
        &mut self,
        path: &str,
        data: &[u8],
        offset: u64,
        mode: AccessMode,
    ) -> Result<usize> {
        let (nr, mut node) = self.load_inode(path)?;
        if node.kind == InodeKind::Directory {
            return Err(DfsError::IsDirectory);
        }
        if !mode.can_write() {
            return Err(DfsError::PermissionDenied);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let old_blocks = node.n_blocks;
        let end = offset + data.len() as u64;
        let needed = blocks_for_bytes(end);
        if needed > old_blocks {
            if let Err(err) = blockmap::grow(&mut self.dev, &mut self.sb, &mut node, needed) {
                blockmap::shrink(&mut self.dev, &mut self.sb, &mut node, old_blocks)?;
                self.commit();
                return Err(err);
            }
        }

        let mut written = 0;
        let mut failure = None;
        let mut buf = [0_u8; BLOCK_SIZE];
        while written < data.len() {
            let abs = offset + written as u64;
            let pos = abs / BLOCK_SIZE as u64;
            let within = usize::try_from(abs % BLOCK_SIZE as u64).expect("offset fits usize");
            let chunk = (BLOCK_SIZE - within).min(data.len() - written);
            dedup::read(&self.dev, &node, pos, &mut buf);
            buf[within..within + chunk].copy_from_slice(&data[written..written + chunk]);
            match dedup::write(&mut self.dev, &mut self.sb, &mut node, pos, &buf) {
                Ok(()) => written += chunk,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if written < data.len() {
            // Trim slots grown for bytes that never arrived.
            let keep = old_blocks.max(blocks_for_bytes(offset + written as u64));
            blockmap::shrink(&mut self.dev, &mut self.sb, &mut node, keep)?;
        }
        if written == 0 {
            self.commit();
            return Err(failure.unwrap_or_else(|| DfsError::Internal("empty write loop".into())));
        }
        node.size = node.size.max(offset + written as u64);
        let now = now_secs();
        node.mtime = now;
        node.ctime = now;
        inode::write(&mut self.dev, &self.sb, nr, &node);
        self.commit();
        debug!(target: "dfs::fs", path, offset, written, "write");
        Ok(written)
    }

    /// Truncate or extend to `size` bytes. Newly exposed bytes read as zero.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        let (nr, mut node) = self.load_inode(path)?;
        if node.kind == InodeKind::Directory {
            return Err(DfsError::IsDirectory);
        }
        let shrinking = size < node.size;
        blockmap::resize(&mut self.dev, &mut self.sb, &mut node, blocks_for_bytes(size))?;
        if shrinking && size % BLOCK_SIZE as u64 != 0 {
            // Zero the tail of the last surviving block so a later extension
            // cannot resurface stale bytes.
            let pos = size / BLOCK_SIZE as u64;
            if !blockmap::resolve(&self.dev, &node, pos).is_null() {
                let mut buf = [0_u8; BLOCK_SIZE];
                dedup::read(&self.dev, &node, pos, &mut buf);
                let keep = usize::try_from(size % BLOCK_SIZE as u64).expect("offset fits usize");
                buf[keep..].fill(0);
                dedup::write(&mut self.dev, &mut self.sb, &mut node, pos, &buf)?;
            }
        }
        node.size = size;
        let now = now_secs();
        node.mtime = now;
        node.ctime = now;
        inode::write(&mut self.dev, &self.sb, nr, &node);
        self.commit();
        Ok(())
    }

    // ── Entry lifecycle ─────────────────────────────────────────────────

    pub fn create(&mut self, path: &str, mode: u32) -> Result<Attr> {
        self.make_entry(path, InodeKind::File, mode)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<Attr> {
        self.make_entry(path, InodeKind::Directory, mode)
    }

    fn make_entry(&mut self, path: &str, kind: InodeKind, mode: u32) -> Result<Attr> {
        let nr = path::create_entry(&mut self.dev, &mut self.sb, path, kind, mode, now_secs())?;
        self.commit();
        Ok(attr_of(nr, &inode::read(&self.dev, &self.sb, nr)))
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        path::remove_entry(&mut self.dev, &mut self.sb, path, InodeKind::File, now_secs())?;
        self.commit();
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        path::remove_entry(
            &mut self.dev,
            &mut self.sb,
            path,
            InodeKind::Directory,
            now_secs(),
        )?;
        self.commit();
        Ok(())
    }

    pub fn utimens(&mut self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        let (nr, mut node) = self.load_inode(path)?;
        node.atime = atime;
        node.mtime = mtime;
        inode::write(&mut self.dev, &self.sb, nr, &node);
        self.commit();
        Ok(())
    }

    /// The raw image, for inspection. Not a portable on-disk format.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        self.dev.image()
    }
}

fn attr_of(nr: InodeNr, node: &Inode) -> Attr {
    let (kind, nlink) = match node.kind {
        InodeKind::Directory => (
            FileKind::Directory,
            2 + u32::try_from(node.size).unwrap_or(u32::MAX - 2),
        ),
        _ => (FileKind::File, 1),
    };
    Attr {
        ino: nr,
        kind,
        mode: node.mode,
        size: node.size,
        n_blocks: node.n_blocks,
        atime: node.atime,
        mtime: node.mtime,
        ctime: node.ctime,
        nlink,
    }
}

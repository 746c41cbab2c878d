//! Path resolution and directory-entry lifecycle.
//!
//! Paths are slash-separated UTF-8. Leading slashes are consumed, empty
//! components are rejected, and each component is limited to 255 bytes.
//! Entry names live in the child inodes themselves; lookup is a linear scan
//! over a directory's children.

use crate::blockmap;
use crate::device::Device;
use crate::dir;
use crate::inode::{self, Inode, InodeKind};
use crate::superblock::Superblock;
use dfs_error::{DfsError, Result};
use dfs_types::{InodeNr, NAME_MAX};
use tracing::debug;

/// Split a path into validated components. An empty list is the root.
pub fn split(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    for comp in trimmed.split('/') {
        if comp.is_empty() {
            return Err(DfsError::NotFound(path.to_owned()));
        }
        if comp.len() > NAME_MAX {
            return Err(DfsError::NameTooLong);
        }
        parts.push(comp);
    }
    Ok(parts)
}

/// Find the child of `dir` named `name`.
#[must_use]
pub fn lookup_child(dev: &Device, sb: &Superblock, dir: &Inode, name: &str) -> Option<InodeNr> {
    for i in 0..dir.size {
        let nr = dir::child_at(dev, dir, i);
        if inode::read(dev, sb, nr).name == name {
            return Some(nr);
        }
    }
    None
}

fn resolve_components(
    dev: &Device,
    sb: &Superblock,
    parts: &[&str],
    path: &str,
) -> Result<InodeNr> {
    let mut cur = sb.root_ino;
    for comp in parts {
        let node = inode::read(dev, sb, cur);
        if node.kind != InodeKind::Directory {
            return Err(DfsError::NotDirectory);
        }
        cur = lookup_child(dev, sb, &node, comp)
            .ok_or_else(|| DfsError::NotFound(path.to_owned()))?;
    }
    Ok(cur)
}

/// Resolve a path to an inode number.
pub fn resolve(dev: &Device, sb: &Superblock, path: &str) -> Result<InodeNr> {
    let parts = split(path)?;
    resolve_components(dev, sb, &parts, path)
}

/// Create the last component of `path` as a fresh inode of `kind`.
///
/// Missing intermediate directories are not auto-created.
pub fn create_entry(
    dev: &mut Device,
    sb: &mut Superblock,
    path: &str,
    kind: InodeKind,
    mode: u32,
    now: u64,
) -> Result<InodeNr> {
    debug_assert_ne!(kind, InodeKind::Unused);
    let parts = split(path)?;
    let Some((name, parent_parts)) = parts.split_last() else {
        return Err(DfsError::Exists);
    };
    let parent_nr = resolve_components(dev, sb, parent_parts, path)?;
    let mut parent = inode::read(dev, sb, parent_nr);
    if parent.kind != InodeKind::Directory {
        return Err(DfsError::NotDirectory);
    }
    if lookup_child(dev, sb, &parent, name).is_some() {
        return Err(DfsError::Exists);
    }

    let child_nr = inode::find_free(dev, sb)?;
    inode::write(dev, sb, child_nr, &Inode::new(kind, name, mode, now));
    if let Err(err) = dir::add_child(dev, sb, &mut parent, child_nr) {
        inode::write(dev, sb, child_nr, &Inode::unused());
        return Err(err);
    }
    parent.mtime = now;
    parent.ctime = now;
    inode::write(dev, sb, parent_nr, &parent);
    sb.n_inode_used += 1;
    debug!(target: "dfs::path", path, ino = child_nr.0, ?kind, "created entry");
    Ok(child_nr)
}

/// Remove the entry at `path`, releasing its data blocks and its inode.
///
/// `expect` is the kind the caller requires: removing a directory through
/// the file variant fails `IsDirectory` and vice versa; a non-empty
/// directory fails `NotEmpty`.
pub fn remove_entry(
    dev: &mut Device,
    sb: &mut Superblock,
    path: &str,
    expect: InodeKind,
    now: u64,
) -> Result<()> {
    let parts = split(path)?;
    let Some((name, parent_parts)) = parts.split_last() else {
        // The root directory is not removable.
        return Err(DfsError::PermissionDenied);
    };
    let parent_nr = resolve_components(dev, sb, parent_parts, path)?;
    let mut parent = inode::read(dev, sb, parent_nr);
    if parent.kind != InodeKind::Directory {
        return Err(DfsError::NotDirectory);
    }
    let child_nr = lookup_child(dev, sb, &parent, name)
        .ok_or_else(|| DfsError::NotFound(path.to_owned()))?;
    let mut child = inode::read(dev, sb, child_nr);
    match (child.kind, expect) {
        (InodeKind::Directory, InodeKind::File) => return Err(DfsError::IsDirectory),
        (InodeKind::File, InodeKind::Directory) => return Err(DfsError::NotDirectory),
        _ => {}
    }
    if child.kind == InodeKind::Directory && child.size > 0 {
        return Err(DfsError::NotEmpty);
    }

    blockmap::shrink(dev, sb, &mut child, 0)?;
    inode::write(dev, sb, child_nr, &Inode::unused());
    dir::remove_child(dev, sb, &mut parent, child_nr)?;
    parent.mtime = now;
    parent.ctime = now;
    inode::write(dev, sb, parent_nr, &parent);
    sb.n_inode_used -= 1;
    debug!(target: "dfs::path", path, ino = child_nr.0, "removed entry");
    Ok(())
}

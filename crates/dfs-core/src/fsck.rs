//! Consistency checker.
//!
//! Read-only audit of a live filesystem: freelist/reference disjointness,
//! reference counts against the block index, digest integrity, and the
//! superblock counters. The integration suite runs this after every
//! scenario step; embedders can run it whenever they want a full audit.

use crate::blockmap;
use crate::dedup;
use crate::dir;
use crate::fs::DedupFs;
use crate::index;
use crate::inode::{self, InodeKind};
use dfs_types::{InodeNr, PhysBlock};
use std::collections::{HashMap, HashSet};

/// Outcome of a full audit. Empty `errors` means every invariant held.
#[derive(Debug, Default)]
pub struct FsckReport {
    pub errors: Vec<String>,
}

impl FsckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn flag(&mut self, msg: String) {
        self.errors.push(msg);
    }
}

/// Audit the filesystem and report every violated invariant.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn check(fs: &DedupFs) -> FsckReport {
    let dev = &fs.dev;
    let sb = &fs.sb;
    let mut report = FsckReport::default();

    // Freelist walk, with a cycle guard.
    let mut free = HashSet::new();
    let mut cursor = sb.freelist;
    while cursor != 0 {
        let block = PhysBlock(cursor);
        if !sb.in_data_region(block) {
            report.flag(format!("freelist block {cursor} outside data region"));
            break;
        }
        if !free.insert(cursor) {
            report.flag(format!("freelist cycles through block {cursor}"));
            break;
        }
        cursor = dev.read_u64_slot(block, 0);
    }

    // Walk every inode's block map, tallying references per physical block
    // and collecting chain blocks.
    let mut refs: HashMap<u64, u64> = HashMap::new();
    let mut chain: HashSet<u64> = HashSet::new();
    let mut used_inodes = 0_u64;
    for nr in 0..sb.n_inodes {
        let node = inode::read(dev, sb, InodeNr(nr));
        if node.kind == InodeKind::Unused {
            continue;
        }
        used_inodes += 1;
        for c in blockmap::chain_blocks(dev, &node) {
            if !sb.in_data_region(c) {
                report.flag(format!("inode {nr}: chain block {c} outside data region"));
            }
            if !chain.insert(c.0) {
                report.flag(format!("chain block {c} linked twice"));
            }
        }
        for pos in 0..node.n_blocks {
            let phys = blockmap::resolve(dev, &node, pos);
            if phys.is_null() {
                continue;
            }
            if !sb.in_data_region(phys) {
                report.flag(format!(
                    "inode {nr}: logical block {pos} maps outside data region ({phys})"
                ));
                continue;
            }
            *refs.entry(phys.0).or_insert(0) += 1;
        }
        if node.kind == InodeKind::Directory {
            let expect = (node.size * 8).div_ceil(dfs_types::BLOCK_SIZE as u64);
            if node.n_blocks != expect {
                report.flag(format!(
                    "directory inode {nr}: {} entries need {expect} blocks, map has {}",
                    node.size, node.n_blocks
                ));
            }
            for i in 0..node.size {
                let child = dir::child_at(dev, &node, i);
                if child.0 >= sb.n_inodes {
                    report.flag(format!("directory inode {nr}: child {child} out of range"));
                } else if inode::read(dev, sb, child).kind == InodeKind::Unused {
                    report.flag(format!("directory inode {nr}: child {child} is unused"));
                }
            }
        } else if node.size > node.n_blocks * dfs_types::BLOCK_SIZE as u64 {
            report.flag(format!(
                "inode {nr}: size {} exceeds {} mapped blocks",
                node.size, node.n_blocks
            ));
        }
    }

    // Every role is exclusive and together they cover the data region.
    for phys in refs.keys() {
        if free.contains(phys) {
            report.flag(format!("block {phys} both referenced and free"));
        }
        if chain.contains(phys) {
            report.flag(format!("block {phys} both data and chain"));
        }
    }
    for phys in &chain {
        if free.contains(phys) {
            report.flag(format!("block {phys} both chain and free"));
        }
    }
    let covered = free.len() + refs.len() + chain.len();
    if covered as u64 != sb.n_blocks {
        report.flag(format!(
            "{covered} blocks accounted for, data region has {}",
            sb.n_blocks
        ));
    }

    // Index walk: digests strictly ascending in-order, refcounts matching
    // the tally, content matching the stored digest.
    let mut indexed = HashSet::new();
    let mut last_digest = None;
    let mut stack = Vec::new();
    let mut cursor = sb.index_root;
    while cursor != 0 || !stack.is_empty() {
        while cursor != 0 {
            if !sb.in_data_region(PhysBlock(cursor)) || !indexed.insert(cursor) {
                report.flag(format!("index node {cursor} invalid or repeated"));
                cursor = 0;
                break;
            }
            stack.push(cursor);
            cursor = index::read_entry(dev, sb, PhysBlock(cursor)).left;
        }
        let Some(node) = stack.pop() else {
            break;
        };
        let entry = index::read_entry(dev, sb, PhysBlock(node));
        if let Some(prev) = last_digest {
            if entry.digest <= prev {
                report.flag(format!("index order violated at block {node}"));
            }
        }
        last_digest = Some(entry.digest);
        let actual = dedup::digest_block(dev.block(PhysBlock(node)));
        if actual != entry.digest {
            report.flag(format!(
                "block {node}: content digest {actual} != indexed {}",
                entry.digest
            ));
        }
        let tallied = refs.get(&node).copied().unwrap_or(0);
        if entry.refs != tallied {
            report.flag(format!(
                "block {node}: refcount {} but {tallied} logical slots reference it",
                entry.refs
            ));
        }
        cursor = entry.right;
    }
    for phys in refs.keys() {
        if !indexed.contains(phys) {
            report.flag(format!("referenced block {phys} missing from index"));
        }
    }

    // Superblock counters.
    if sb.n_block_used != sb.n_blocks - free.len() as u64 {
        report.flag(format!(
            "n_block_used {} but freelist holds {} of {}",
            sb.n_block_used,
            free.len(),
            sb.n_blocks
        ));
    }
    if sb.n_inode_used != used_inodes {
        report.flag(format!(
            "n_inode_used {} but {used_inodes} inodes are in use",
            sb.n_inode_used
        ));
    }

    report
}

#![forbid(unsafe_code)]
//! End-to-end scenarios over the path-keyed facade, each step audited by
//! the consistency checker.

use dfs_core::{fsck, AccessMode, DedupFs, DfsError, FsOptions, BLOCK_SIZE};

const RW: AccessMode = AccessMode::ReadWrite;

fn default_fs() -> DedupFs {
    DedupFs::format(&FsOptions::default()).expect("format")
}

fn used_blocks(fs: &DedupFs) -> u64 {
    let st = fs.statfs();
    st.total_blocks - st.free_blocks
}

fn audit(fs: &DedupFs) {
    let report = fsck::check(fs);
    assert!(report.is_clean(), "fsck: {:?}", report.errors);
}

#[test]
fn create_write_getattr() {
    let mut fs = default_fs();
    fs.create("/a", 0o644).unwrap();
    // One block for the root directory's entry list.
    let base = used_blocks(&fs);
    assert_eq!(base, 1);
    fs.write("/a", b"hello", 0, RW).unwrap();

    let attr = fs.getattr("/a").unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(attr.n_blocks, 1);
    assert_eq!(used_blocks(&fs), base + 1);
    audit(&fs);
}

#[test]
fn identical_files_share_storage_until_the_last_unlink() {
    let mut fs = default_fs();
    fs.create("/a", 0o644).unwrap();
    fs.write("/a", b"hello", 0, RW).unwrap();
    fs.create("/b", 0o644).unwrap();
    let base = used_blocks(&fs);
    fs.write("/b", b"hello", 0, RW).unwrap();
    assert_eq!(used_blocks(&fs), base, "identical content deduplicated");
    audit(&fs);

    fs.unlink("/a").unwrap();
    assert_eq!(used_blocks(&fs), base, "survivor keeps the block");
    audit(&fs);

    // The last unlink frees the payload, and the now-empty root directory
    // releases its entry block too.
    fs.unlink("/b").unwrap();
    assert_eq!(used_blocks(&fs), 0, "last unlink frees everything");
    audit(&fs);
}

#[test]
fn rmdir_refuses_non_empty_directories() {
    let mut fs = default_fs();
    fs.mkdir("/d", 0o755).unwrap();
    fs.create("/d/x", 0o644).unwrap();
    assert!(matches!(fs.rmdir("/d"), Err(DfsError::NotEmpty)));
    fs.unlink("/d/x").unwrap();
    fs.rmdir("/d").unwrap();
    assert!(matches!(fs.getattr("/d"), Err(DfsError::NotFound(_))));
    audit(&fs);
}

#[test]
fn extending_past_the_direct_slots_costs_one_chain_block() {
    let mut fs = default_fs();
    fs.create("/big", 0o644).unwrap();
    let base = used_blocks(&fs);

    // 15 direct slots exactly; every block distinct so nothing dedups.
    let direct_bytes = 15 * BLOCK_SIZE;
    let mut buf = vec![0_u8; direct_bytes];
    for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
        chunk.fill(u8::try_from(i + 1).unwrap());
    }
    fs.write("/big", &buf, 0, RW).unwrap();
    assert_eq!(fs.getattr("/big").unwrap().n_blocks, 15);
    assert_eq!(used_blocks(&fs), base + 15, "no chain block yet");
    audit(&fs);

    // One more byte: one data block plus one chain block.
    fs.write("/big", b"!", direct_bytes as u64, RW).unwrap();
    assert_eq!(fs.getattr("/big").unwrap().n_blocks, 16);
    assert_eq!(used_blocks(&fs), base + 17);
    audit(&fs);
}

#[test]
fn exhaustion_fails_cleanly_and_earlier_data_survives() {
    let mut fs = DedupFs::format(&FsOptions {
        total_blocks: 256,
        inodes: 16,
    })
    .unwrap();
    fs.create("/keep", 0o644).unwrap();
    fs.create("/fill", 0o644).unwrap();
    fs.create("/more", 0o644).unwrap();
    let keep = [0x42_u8; 2 * BLOCK_SIZE];
    fs.write("/keep", &keep, 0, RW).unwrap();

    // Fill the rest of the data region with distinct blocks.
    let mut offset = 0_u64;
    let mut stamp = 0_u64;
    loop {
        let mut block = [0_u8; BLOCK_SIZE];
        block[..8].copy_from_slice(&stamp.to_le_bytes());
        stamp += 1;
        match fs.write("/fill", &block, offset, RW) {
            Ok(n) => offset += n as u64,
            Err(DfsError::NoSpace) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(fs.statfs().free_blocks, 0);

    // Another distinct write still fails, and nothing got corrupted.
    let mut block = [0_u8; BLOCK_SIZE];
    block[..8].copy_from_slice(&u64::MAX.to_le_bytes());
    assert!(matches!(
        fs.write("/more", &block, 0, RW),
        Err(DfsError::NoSpace)
    ));

    let back = fs.read("/keep", 0, keep.len() as u32, RW).unwrap();
    assert_eq!(back, keep);
    audit(&fs);
}

#[test]
fn create_twice_and_missing_parents() {
    let mut fs = default_fs();
    fs.create("/a", 0o644).unwrap();
    assert!(matches!(fs.create("/a", 0o644), Err(DfsError::Exists)));
    assert!(matches!(
        fs.create("/sub/x", 0o644),
        Err(DfsError::NotFound(_))
    ));
    audit(&fs);
}

#[test]
fn mkdir_under_a_file_fails_not_directory() {
    let mut fs = default_fs();
    fs.create("/f", 0o644).unwrap();
    assert!(matches!(
        fs.mkdir("/f/d", 0o755),
        Err(DfsError::NotDirectory)
    ));
    audit(&fs);
}

#[test]
fn statfs_tracks_usage() {
    let mut fs = default_fs();
    let st = fs.statfs();
    assert_eq!(st.block_size, BLOCK_SIZE as u32);
    assert_eq!(st.name_max, 255);
    assert_eq!(st.free_inodes, st.total_inodes - 1);

    fs.create("/a", 0o644).unwrap();
    fs.write("/a", &[7_u8; BLOCK_SIZE + 1], 0, RW).unwrap();
    let st = fs.statfs();
    // Two payload blocks plus the root directory's entry block.
    assert_eq!(st.total_blocks - st.free_blocks, 3);
    assert_eq!(st.free_inodes, st.total_inodes - 2);
    audit(&fs);
}

#[test]
fn overwrite_with_identical_content_changes_nothing() {
    let mut fs = default_fs();
    fs.create("/a", 0o644).unwrap();
    let data = [0x7E_u8; BLOCK_SIZE];
    fs.write("/a", &data, 0, RW).unwrap();
    let before = used_blocks(&fs);
    fs.write("/a", &data, 0, RW).unwrap();
    assert_eq!(used_blocks(&fs), before);
    audit(&fs);
}

#[test]
fn many_identical_files_keep_one_copy_until_the_end() {
    let mut fs = default_fs();
    let n = 8;
    for i in 0..n {
        let path = format!("/f{i}");
        fs.create(&path, 0o644).unwrap();
        fs.write(&path, b"common payload", 0, RW).unwrap();
    }
    // One shared payload block plus the root directory's entry block.
    assert_eq!(used_blocks(&fs), 2);
    audit(&fs);

    for i in 0..n - 1 {
        fs.unlink(&format!("/f{i}")).unwrap();
        assert_eq!(used_blocks(&fs), 2, "after unlinking f{i}");
    }
    audit(&fs);
    fs.unlink(&format!("/f{}", n - 1)).unwrap();
    assert_eq!(used_blocks(&fs), 0);
    audit(&fs);
}

#[test]
fn deep_tree_create_list_remove() {
    let mut fs = default_fs();
    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/a/b", 0o755).unwrap();
    fs.mkdir("/a/b/c", 0o755).unwrap();
    fs.create("/a/b/c/leaf", 0o644).unwrap();
    fs.write("/a/b/c/leaf", b"deep", 0, RW).unwrap();

    assert_eq!(fs.readdir("/a/b").unwrap(), vec![".", "..", "c"]);
    assert_eq!(
        fs.read("/a/b/c/leaf", 0, 10, AccessMode::ReadOnly).unwrap(),
        b"deep"
    );
    audit(&fs);

    fs.unlink("/a/b/c/leaf").unwrap();
    fs.rmdir("/a/b/c").unwrap();
    fs.rmdir("/a/b").unwrap();
    fs.rmdir("/a").unwrap();
    assert_eq!(fs.statfs().free_inodes, fs.statfs().total_inodes - 1);
    assert_eq!(used_blocks(&fs), 0);
    audit(&fs);
}

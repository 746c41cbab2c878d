#![forbid(unsafe_code)]
//! FUSE adapter for dedupfs.
//!
//! A thin translation layer: kernel requests arrive via the `fuser` crate
//! keyed by inode number, get mapped to the path-keyed [`DedupFs`] facade,
//! and errors are mapped through [`dfs_error::DfsError::to_errno()`]. The core is
//! single-threaded by design, so the adapter holds it behind one coarse
//! mutex.
//!
//! Inode bookkeeping: the kernel's ino is the core inode number plus one
//! (FUSE reserves ino 1 for the root, the core numbers its root 0). Paths
//! for already-seen inos are remembered from `lookup` traffic.

use dfs_core::{AccessMode, Attr, DedupFs, FileKind};
use dfs_types::BLOCK_SIZE;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries. The core is the only mutator, so
/// short-lived kernel caching is safe.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Offset between kernel inos and core inode numbers.
const INO_BASE: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
    }
}

fn secs_to_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn time_to_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn to_file_attr(attr: &Attr, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: attr.ino.0 + INO_BASE,
        size: attr.size,
        blocks: attr.n_blocks,
        atime: secs_to_time(attr.atime),
        mtime: secs_to_time(attr.mtime),
        ctime: secs_to_time(attr.ctime),
        crtime: secs_to_time(attr.ctime),
        kind: to_fuser_file_type(attr.kind),
        perm: u16::try_from(attr.mode & 0o7777).unwrap_or(0),
        nlink: attr.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

/// Decode the access mode from POSIX open flags.
fn access_mode(flags: i32) -> Option<AccessMode> {
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => Some(AccessMode::ReadOnly),
        libc::O_WRONLY => Some(AccessMode::WriteOnly),
        libc::O_RDWR => Some(AccessMode::ReadWrite),
        _ => None,
    }
}

/// Stateless file handles: the access mode rides in the handle bits so read
/// and write can enforce it.
fn mode_to_fh(mode: AccessMode) -> u64 {
    match mode {
        AccessMode::ReadOnly => 0,
        AccessMode::WriteOnly => 1,
        AccessMode::ReadWrite => 2,
    }
}

fn fh_to_mode(fh: u64) -> AccessMode {
    match fh {
        1 => AccessMode::WriteOnly,
        2 => AccessMode::ReadWrite,
        _ => AccessMode::ReadOnly,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter owning the filesystem behind one coarse lock.
pub struct DedupFuse {
    fs: Mutex<DedupFs>,
    paths: HashMap<u64, String>,
}

impl DedupFuse {
    #[must_use]
    pub fn new(fs: DedupFs) -> Self {
        let mut paths = HashMap::new();
        paths.insert(INO_BASE, "/".to_owned());
        Self {
            fs: Mutex::new(fs),
            paths,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    /// Path for `name` under the directory with kernel ino `parent`.
    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let dir = self.path_of(parent)?;
        let name = name.to_str()?;
        if dir == "/" {
            Some(format!("/{name}"))
        } else {
            Some(format!("{dir}/{name}"))
        }
    }

    fn remember(&mut self, attr: &Attr, path: String) {
        self.paths.insert(attr.ino.0 + INO_BASE, path);
    }

    fn forget_path(&mut self, ino: u64) {
        self.paths.remove(&ino);
    }

    fn parent_path(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_owned(),
            Some(idx) => path[..idx].to_owned(),
        }
    }
}

impl Filesystem for DedupFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let looked_up = self.fs.lock().getattr(&path);
        match looked_up {
            Ok(attr) => {
                let fattr = to_file_attr(&attr, req.uid(), req.gid());
                self.remember(&attr, path);
                reply.entry(&ATTR_TTL, &fattr, 0);
            }
            Err(e) => {
                if e.to_errno() != libc::ENOENT {
                    warn!(parent, ?name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.lock().getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr, req.uid(), req.gid())),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut fs = self.fs.lock();

        if let Some(new_size) = size {
            if let Err(e) = fs.truncate(&path, new_size) {
                warn!(ino, new_size, error = %e, "truncate failed");
                reply.error(e.to_errno());
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let resolve = |t: Option<TimeOrNow>, fallback: u64| match t {
                Some(TimeOrNow::SpecificTime(st)) => time_to_secs(st),
                Some(TimeOrNow::Now) => time_to_secs(SystemTime::now()),
                None => fallback,
            };
            let current = match fs.getattr(&path) {
                Ok(attr) => attr,
                Err(e) => {
                    reply.error(e.to_errno());
                    return;
                }
            };
            let atime_secs = resolve(atime, current.atime);
            let mtime_secs = resolve(mtime, current.mtime);
            if let Err(e) = fs.utimens(&path, atime_secs, mtime_secs) {
                reply.error(e.to_errno());
                return;
            }
        }

        match fs.getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr, req.uid(), req.gid())),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let made = self.fs.lock().mkdir(&path, mode & 0o7777);
        match made {
            Ok(attr) => {
                let fattr = to_file_attr(&attr, req.uid(), req.gid());
                self.remember(&attr, path);
                reply.entry(&ATTR_TTL, &fattr, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut fs = self.fs.lock();
        let ino = fs.getattr(&path).map(|attr| attr.ino.0 + INO_BASE);
        match fs.unlink(&path) {
            Ok(()) => {
                drop(fs);
                if let Ok(ino) = ino {
                    self.forget_path(ino);
                }
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut fs = self.fs.lock();
        let ino = fs.getattr(&path).map(|attr| attr.ino.0 + INO_BASE);
        match fs.rmdir(&path) {
            Ok(()) => {
                drop(fs);
                if let Ok(ino) = ino {
                    self.forget_path(ino);
                }
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(mode) = access_mode(flags) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.lock().open(&path) {
            Ok(_) => reply.opened(mode_to_fh(mode), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.lock().read(&path, offset, size, fh_to_mode(fh)) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.lock().write(&path, data, offset, fh_to_mode(fh)) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => {
                warn!(ino, offset, len = data.len(), error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = self.fs.lock();
        let names = match fs.readdir(&path) {
            Ok(names) => names,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let start = usize::try_from(offset).unwrap_or(0);
        let mut entries = Vec::new();
        for (idx, name) in names.iter().enumerate().skip(start) {
            let (entry_ino, kind) = match name.as_str() {
                "." => (ino, FileType::Directory),
                ".." => {
                    let parent = Self::parent_path(&path);
                    match fs.getattr(&parent) {
                        Ok(attr) => (attr.ino.0 + INO_BASE, FileType::Directory),
                        Err(_) => (INO_BASE, FileType::Directory),
                    }
                }
                child => {
                    let child_path = if path == "/" {
                        format!("/{child}")
                    } else {
                        format!("{path}/{child}")
                    };
                    match fs.getattr(&child_path) {
                        Ok(attr) => (attr.ino.0 + INO_BASE, to_fuser_file_type(attr.kind)),
                        Err(_) => continue,
                    }
                }
            };
            entries.push((entry_ino, idx as i64 + 1, kind, name.clone()));
        }
        drop(fs);
        for (entry_ino, next_offset, kind, name) in entries {
            if reply.add(entry_ino, next_offset, kind, OsStr::new(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(access) = access_mode(flags) else {
            reply.error(libc::EINVAL);
            return;
        };
        let created = self.fs.lock().create(&path, mode & 0o7777);
        match created {
            Ok(attr) => {
                let fattr = to_file_attr(&attr, req.uid(), req.gid());
                self.remember(&attr, path);
                reply.created(&ATTR_TTL, &fattr, 0, mode_to_fh(access), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = self.fs.lock().statfs();
        reply.statfs(
            st.total_blocks,
            st.free_blocks,
            st.free_blocks,
            st.total_inodes,
            st.free_inodes,
            st.block_size,
            st.name_max,
            st.block_size,
        );
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("dedupfs".to_owned()),
        MountOption::Subtype("dfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

/// Mount at `mountpoint` (blocking until unmounted). The filesystem's
/// contents vanish with the process.
pub fn mount(
    fs: DedupFs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    fuser::mount2(DedupFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background, returning a session handle that unmounts on
/// drop.
pub fn mount_background(
    fs: DedupFs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let session = fuser::spawn_mount2(DedupFuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(session)
}

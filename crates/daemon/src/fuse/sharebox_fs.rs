//! FUSE request handler.
//!
//! Every operation works against the local cache and the metadata store,
//! never against the bucket directly; a write is acknowledged as soon as it
//! lands in the cache and the entry turns locally-modified. The sync engine
//! is only ever nudged through the trigger channel.
//!
//! FUSE callbacks arrive on fuser's threads while the metadata store is
//! async, so the handler keeps a runtime handle and blocks on each query.
//! These are local SQLite lookups; the latency is well under what FUSE
//! callers already tolerate.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use common::crypto::content_hash;
use common::metadata::SyncState;
use common::{CacheDir, ExclusionFilter, FileEntry, MetadataStore, SyncHandle};

use super::inode_table::InodeTable;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;
/// How long open and read wait for a remote file to materialize.
const DOWNLOAD_WAIT: Duration = Duration::from_secs(30);
const DOWNLOAD_POLL: Duration = Duration::from_millis(100);

struct OpenHandle {
    path: String,
    dirty: bool,
}

/// The mounted filesystem.
pub struct ShareBoxFs {
    meta: MetadataStore,
    cache: Arc<CacheDir>,
    sync: SyncHandle,
    filter: ExclusionFilter,
    runtime: Handle,
    device: String,
    max_file_size: u64,
    encrypted: bool,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

impl ShareBoxFs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta: MetadataStore,
        cache: Arc<CacheDir>,
        sync: SyncHandle,
        filter: ExclusionFilter,
        runtime: Handle,
        device: impl Into<String>,
        max_file_size: u64,
        encrypted: bool,
    ) -> Self {
        Self {
            meta,
            cache,
            sync,
            filter,
            runtime,
            device: device.into(),
            max_file_size,
            encrypted,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.lock().get_path(ino).map(str::to_string)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        if name.contains('/') || name == "." || name == ".." {
            return None;
        }
        let parent = self.path_of(parent)?;
        Some(if parent == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent, name)
        })
    }

    fn get_entry(&self, path: &str) -> Option<FileEntry> {
        self.runtime
            .block_on(self.meta.get(path))
            .ok()
            .flatten()
    }

    fn attr(&self, ino: u64, entry: &FileEntry) -> FileAttr {
        let mtime = UNIX_EPOCH + Duration::from_secs(entry.mtime.max(0) as u64);
        let (kind, perm, nlink) = if entry.is_dir {
            (FileType::Directory, 0o755, 2)
        } else {
            (FileType::RegularFile, 0o644, 1)
        };
        FileAttr {
            ino,
            size: entry.size,
            blocks: entry.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes for a path that lives in the cache without a metadata
    /// entry (an excluded, local-only file).
    fn cache_attr(&self, ino: u64, path: &str) -> Option<FileAttr> {
        let abs = self.cache.abs(path).ok()?;
        let meta = std::fs::metadata(&abs).ok()?;
        let mtime = meta.modified().ok().unwrap_or(UNIX_EPOCH);
        let (kind, perm, nlink) = if meta.is_dir() {
            (FileType::Directory, 0o755, 2)
        } else {
            (FileType::RegularFile, 0o644, 1)
        };
        Some(FileAttr {
            ino,
            size: meta.len(),
            blocks: meta.len().div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        })
    }

    fn root_attr(&self) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: InodeTable::ROOT_INODE,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Blocks until a remotely-discovered file has been materialized in the
    /// cache, or the wait budget runs out.
    fn wait_for_content(&self, path: &str) -> bool {
        if self.cache.exists(path).unwrap_or(false) {
            return true;
        }
        self.sync.request_path(path);
        let deadline = SystemTime::now() + DOWNLOAD_WAIT;
        while SystemTime::now() < deadline {
            std::thread::sleep(DOWNLOAD_POLL);
            if self.cache.exists(path).unwrap_or(false) {
                return true;
            }
            match self.get_entry(path) {
                // Gone or failed hard; stop waiting.
                None => return false,
                Some(e) if e.attempts > 0 && !e.sync_state.in_flight() => return false,
                Some(_) => {}
            }
        }
        false
    }

    /// Records a completed local write: rehash the cache content, flip the
    /// entry to locally-modified and nudge the engine.
    fn commit_write(&self, path: &str) {
        if self.filter.is_excluded(path) {
            return;
        }
        let _guard = self.cache.lock(path);
        let content = match self.cache.read(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path, error = %e, "failed to read back written file");
                return;
            }
        };
        let hash = content_hash(&content);
        let mtime = self.cache.mtime(path).unwrap_or_else(|_| Self::now());
        let entry = match self.get_entry(path) {
            Some(mut existing) => {
                if existing.local_hash == hash
                    && existing.sync_state == SyncState::Clean
                {
                    return;
                }
                existing.local_hash = hash;
                existing.size = content.len() as u64;
                existing.mtime = mtime;
                existing.sync_state = SyncState::LocallyModified;
                existing.device_origin = self.device.clone();
                existing.attempts = 0;
                existing.last_error = None;
                existing
            }
            None => FileEntry::local_create(
                path,
                hash,
                content.len() as u64,
                mtime,
                &self.device,
                self.encrypted,
            ),
        };
        if let Err(e) = self.runtime.block_on(self.meta.upsert(&entry)) {
            warn!(path, error = %e, "failed to record local write");
            return;
        }
        self.sync.request_path(path);
    }

    fn alloc_fh(&self, path: &str) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(
            fh,
            OpenHandle {
                path: path.to_string(),
                dirty: false,
            },
        );
        fh
    }
}

impl Filesystem for ShareBoxFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(entry) = self.get_entry(&path) {
            let ino = self.inodes.lock().get_or_create(&path);
            reply.entry(&TTL, &self.attr(ino, &entry), 0);
            return;
        }
        // Local-only files (excluded from sync) exist in the cache alone.
        let ino = self.inodes.lock().get_or_create(&path);
        match self.cache_attr(ino, &path) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => {
                self.inodes.lock().remove_by_path(&path);
                reply.error(libc::ENOENT);
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == InodeTable::ROOT_INODE {
            reply.attr(&TTL, &self.root_attr());
            return;
        }
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(entry) = self.get_entry(&path) {
            reply.attr(&TTL, &self.attr(ino, &entry));
        } else if let Some(attr) = self.cache_attr(ino, &path) {
            reply.attr(&TTL, &attr);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
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

        if let Some(new_size) = size {
            if new_size > self.max_file_size {
                reply.error(libc::EFBIG);
                return;
            }
            let truncated = {
                let _guard = self.cache.lock(&path);
                self.cache
                    .abs(&path)
                    .ok()
                    .and_then(|abs| std::fs::OpenOptions::new().write(true).open(abs).ok())
                    .map(|f| f.set_len(new_size).is_ok())
                    .unwrap_or(false)
            };
            if !truncated {
                reply.error(libc::EIO);
                return;
            }
            self.commit_write(&path);
        } else if mtime.is_some() {
            // Tools like rsync set mtimes after writing; reflect it in the
            // metadata so conflict comparison sees the intended timestamp.
            let stamp = match mtime {
                Some(TimeOrNow::SpecificTime(t)) => t
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_else(|_| Self::now()),
                _ => Self::now(),
            };
            if let Some(mut entry) = self.get_entry(&path) {
                entry.mtime = stamp;
                let _ = self.runtime.block_on(self.meta.upsert(&entry));
            }
        }

        if let Some(entry) = self.get_entry(&path) {
            reply.attr(&TTL, &self.attr(ino, &entry));
        } else if let Some(attr) = self.cache_attr(ino, &path) {
            reply.attr(&TTL, &attr);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        if self.cache.create_dir(&path).is_err() {
            reply.error(libc::EIO);
            return;
        }
        let entry = FileEntry::directory(&path, Self::now(), &self.device);
        if let Err(e) = self.runtime.block_on(self.meta.upsert(&entry)) {
            warn!(path, error = %e, "failed to record directory");
            reply.error(libc::EIO);
            return;
        }
        let ino = self.inodes.lock().get_or_create(&path);
        reply.entry(&TTL, &self.attr(ino, &entry), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if self.cache.remove(&path).is_err() {
            reply.error(libc::EIO);
            return;
        }
        match self.get_entry(&path) {
            Some(entry) if entry.remote_version.is_empty() => {
                // Never uploaded; nothing to propagate.
                let _ = self.runtime.block_on(self.meta.remove(&path));
            }
            Some(mut entry) => {
                entry.sync_state = SyncState::Deleted;
                entry.mtime = Self::now();
                entry.attempts = 0;
                entry.last_error = None;
                if let Err(e) = self.runtime.block_on(self.meta.upsert(&entry)) {
                    warn!(path, error = %e, "failed to record delete");
                    reply.error(libc::EIO);
                    return;
                }
                self.sync.request_path(&path);
            }
            None => {}
        }
        self.inodes.lock().remove_by_path(&path);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let has_children = self
            .runtime
            .block_on(self.meta.children(&path))
            .map(|c| !c.is_empty())
            .unwrap_or(true);
        if has_children {
            reply.error(libc::ENOTEMPTY);
            return;
        }
        if self.cache.remove_dir(&path).is_err() {
            reply.error(libc::ENOTEMPTY);
            return;
        }
        let _ = self.runtime.block_on(self.meta.remove(&path));
        self.inodes.lock().remove_by_path(&path);
        reply.ok();
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::EINVAL);
            return;
        };
        let entry = self.get_entry(&from);
        let is_dir = entry.as_ref().map(|e| e.is_dir).unwrap_or(false);

        if self.cache.exists(&from).unwrap_or(false) && self.cache.rename(&from, &to).is_err() {
            reply.error(libc::EIO);
            return;
        }

        let result = if is_dir {
            self.runtime
                .block_on(self.meta.rename_prefix(&from, &to, &self.device))
        } else {
            self.runtime
                .block_on(self.meta.rename(&from, &to, &self.device))
        };
        if let Err(e) = result {
            warn!(from, to, error = %e, "failed to record rename");
            reply.error(libc::EIO);
            return;
        }

        {
            let mut inodes = self.inodes.lock();
            if is_dir {
                inodes.rename_prefix(&from, &to);
            } else {
                inodes.rename(&from, &to);
            }
        }
        // Old path may now carry a tombstone, new path an upload.
        self.sync.request_path(&from);
        self.sync.request_path(&to);
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let needs_content = self
            .get_entry(&path)
            .map(|e| !e.is_dir)
            .unwrap_or(true);
        if needs_content && !self.wait_for_content(&path) {
            reply.error(libc::EIO);
            return;
        }
        reply.opened(self.alloc_fh(&path), 0);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        if self.cache.write_atomic(&path, b"").is_err() {
            reply.error(libc::EIO);
            return;
        }
        let entry = FileEntry::local_create(
            &path,
            content_hash(b""),
            0,
            Self::now(),
            &self.device,
            self.encrypted,
        );
        if !self.filter.is_excluded(&path) {
            if let Err(e) = self.runtime.block_on(self.meta.upsert(&entry)) {
                warn!(path, error = %e, "failed to record create");
                reply.error(libc::EIO);
                return;
            }
        }
        let ino = self.inodes.lock().get_or_create(&path);
        reply.created(&TTL, &self.attr(ino, &entry), 0, self.alloc_fh(&path), 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.handles.lock().get(&fh).map(|h| h.path.clone()) else {
            reply.error(libc::EBADF);
            return;
        };
        let abs = match self.cache.abs(&path) {
            Ok(abs) => abs,
            Err(_) => {
                reply.error(libc::EIO);
                return;
            }
        };
        let mut file = match std::fs::File::open(&abs) {
            Ok(file) => file,
            Err(_) => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if file.seek(SeekFrom::Start(offset.max(0) as u64)).is_err() {
            reply.error(libc::EIO);
            return;
        }
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        loop {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => {
                    reply.error(libc::EIO);
                    return;
                }
            }
            if filled == buf.len() {
                break;
            }
        }
        reply.data(&buf[..filled]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.handles.lock().get(&fh).map(|h| h.path.clone()) else {
            reply.error(libc::EBADF);
            return;
        };
        let end = offset.max(0) as u64 + data.len() as u64;
        if end > self.max_file_size {
            debug!(path, size = end, "write rejected by size limit");
            reply.error(libc::EFBIG);
            return;
        }
        let abs = match self.cache.abs(&path) {
            Ok(abs) => abs,
            Err(_) => {
                reply.error(libc::EIO);
                return;
            }
        };
        let written = {
            let _guard = self.cache.lock(&path);
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&abs)
                .and_then(|mut file| {
                    file.seek(SeekFrom::Start(offset.max(0) as u64))?;
                    file.write_all(data)
                })
        };
        if written.is_err() {
            reply.error(libc::EIO);
            return;
        }
        if let Some(handle) = self.handles.lock().get_mut(&fh) {
            handle.dirty = true;
        }
        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let committed = {
            let mut handles = self.handles.lock();
            match handles.get_mut(&fh) {
                Some(handle) if handle.dirty => {
                    handle.dirty = false;
                    Some(handle.path.clone())
                }
                Some(_) => None,
                None => {
                    drop(handles);
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        if let Some(path) = committed {
            self.commit_write(&path);
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.lock().remove(&fh) {
            if handle.dirty {
                self.commit_write(&handle.path);
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let path = self.handles.lock().get_mut(&fh).and_then(|h| {
            if h.dirty {
                h.dirty = false;
                Some(h.path.clone())
            } else {
                None
            }
        });
        if let Some(path) = path {
            self.commit_write(&path);
        }
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // The namespace is the union of tracked entries and whatever lives
        // in the cache directory (local-only files have no metadata).
        let mut names: Vec<(String, FileType)> = Vec::new();
        if let Ok(children) = self.runtime.block_on(self.meta.children(&dir)) {
            for child in children {
                let name = child
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let kind = if child.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                names.push((name, kind));
            }
        }
        if let Ok(abs) = self.cache.abs(&dir) {
            if let Ok(read_dir) = std::fs::read_dir(&abs) {
                for dirent in read_dir.flatten() {
                    let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if names.iter().any(|(n, _)| *n == name) {
                        continue;
                    }
                    let kind = if dirent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    };
                    names.push((name, kind));
                }
            }
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let mut all = vec![
            (ino, FileType::Directory, ".".to_string()),
            (InodeTable::ROOT_INODE, FileType::Directory, "..".to_string()),
        ];
        for (name, kind) in names {
            let child_path = if dir == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", dir, name)
            };
            let child_ino = self.inodes.lock().get_or_create(&child_path);
            all.push((child_ino, kind, name));
        }

        for (i, (child_ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // Space is bounded by the cache volume, which we cannot see through
        // the logical namespace; report generous fixed numbers.
        reply.statfs(
            1 << 30,
            1 << 29,
            1 << 29,
            0,
            0,
            BLOCK_SIZE,
            255,
            BLOCK_SIZE,
        );
    }
}

// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::collections::HashMap;
use std::ffi::{CStr, OsStr};
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fuser::{
    FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::c_int;
use tracing::debug;

use crate::attr;
use crate::handle::Handle;
use crate::node::{join_path, Inode};
use crate::record::{OpFields, ProcessInfo, Record};
use crate::tracer::Tracer;

pub const PROGRAM_NAME: &str = "trailfs";

const TTL: Duration = Duration::from_secs(1);

// Don't rewrite the targets of symbolic links by default. Some applications
// check when they create a symbolic link that the value they specified as
// target is actually the one the file system uses.
const REWRITE_SYMLINK_TARGETS: bool = false;

/// The tracing pass-through file system: every kernel operation is
/// forwarded to the shadow directory and reported to the tracer.
#[derive(Debug)]
pub struct TrailFs {
    shadow_dir: String,
    mount_dir: String,
    tracer: Arc<Tracer>,
    root: Arc<Inode>,
    // nodes maps kernel inode numbers to their node objects
    nodes: RwLock<HashMap<u64, Arc<Inode>>>,
    // Selected once at startup: on the platform that generates metadata
    // sidecars, entries named '._*' are hidden from lookup and readdir.
    skip_sidecar_entries: bool,
}

impl TrailFs {
    pub fn new(shadow_dir: &Path, tracer: Arc<Tracer>) -> Result<TrailFs> {
        if !shadow_dir.is_absolute() {
            anyhow::bail!("'{}' is not an absolute path", shadow_dir.display());
        }
        std::fs::read_dir(shadow_dir)
            .with_context(|| format!("could not open directory '{}'", shadow_dir.display()))?;

        let shadow = shadow_dir.to_string_lossy().into_owned();
        let root = Inode::new_dir("", &shadow);
        root.ino().set(FUSE_ROOT_ID);
        let mut nodes = HashMap::new();
        nodes.insert(FUSE_ROOT_ID, root.clone());

        Ok(TrailFs {
            shadow_dir: shadow,
            mount_dir: String::new(),
            tracer,
            root,
            nodes: RwLock::new(nodes),
            skip_sidecar_entries: cfg!(target_os = "macos"),
        })
    }

    /// Mounts the file system and serves kernel requests until the mount
    /// point is unmounted externally.
    pub fn mount_and_serve(mut self, mountpoint: &Path, read_only: bool) -> Result<()> {
        self.mount_dir = mountpoint.to_string_lossy().into_owned();
        let mut options = vec![
            MountOption::FSName(PROGRAM_NAME.to_string()),
            MountOption::Subtype(PROGRAM_NAME.to_string()),
        ];
        #[cfg(target_os = "macos")]
        {
            options.push(MountOption::CUSTOM(format!("volname={PROGRAM_NAME}")));
            options.push(MountOption::CUSTOM("local".to_string()));
        }
        if read_only {
            options.push(MountOption::RO);
        }
        let mountpoint = mountpoint.to_path_buf();
        fuser::mount2(self, &mountpoint, &options)
            .with_context(|| format!("serving on '{}' failed", mountpoint.display()))?;
        Ok(())
    }

    fn who(req: &Request<'_>) -> ProcessInfo {
        ProcessInfo {
            uid: req.uid(),
            gid: req.gid(),
            pid: req.pid(),
        }
    }

    fn emit(
        &self,
        who: ProcessInfo,
        started: DateTime<Utc>,
        path: &str,
        is_dir: bool,
        op: OpFields,
    ) {
        let mut record = Record::new(who, started, path, is_dir, op);
        record.set_time_end();
        self.tracer.trace(record);
    }

    fn node(&self, ino: u64) -> Option<Arc<Inode>> {
        self.nodes.read().unwrap().get(&ino).cloned()
    }

    fn register(&self, ino: u64, node: &Arc<Inode>) {
        node.ino().set(ino);
        self.nodes.write().unwrap().insert(ino, node.clone());
    }

    fn unregister(&self, node: &Arc<Inode>) {
        let ino = node.ino().get();
        if ino > FUSE_ROOT_ID {
            self.nodes.write().unwrap().remove(&ino);
        }
    }

    fn skip_dir_entry(&self, name: &str) -> bool {
        self.skip_sidecar_entries && name.starts_with("._")
    }

    /// Resolves one name under a directory: stats the backing path and
    /// returns the cached child object when there is one, installing a new
    /// one otherwise. Node identity is preserved across lookups.
    fn lookup_child(
        &self,
        parent: &Arc<Inode>,
        name: &str,
    ) -> io::Result<(Arc<Inode>, fuser::FileAttr)> {
        let dir = parent
            .as_dir()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTDIR))?;
        let parent_path = parent.path();
        let path = join_path(&parent_path, name);
        let st = attr::lstat(&path)?;
        let fattr = attr::stat_to_attr(&st);

        let child = match dir.get_entry(name) {
            // The cached node is returned even when its kind no longer
            // agrees with the fresh stat result.
            Some(existing) => existing,
            None => {
                let node = if fattr.kind == FileType::Directory {
                    Inode::new_dir(&parent_path, name)
                } else {
                    Inode::new_file(&parent_path, name)
                };
                dir.save_entry(name, node.clone());
                node
            }
        };
        self.register(fattr.ino, &child);
        Ok((child, fattr))
    }

    /// Removes the bookkeeping for a name after the backing entry is gone.
    fn detach_child(&self, parent: &Arc<Inode>, name: &str) {
        if let Some(dir) = parent.as_dir() {
            if let Some(child) = dir.drop_entry(name) {
                self.unregister(&child);
            }
        }
    }

    /// Moves a child between directory maps after a successful backing
    /// rename, updating the node's parent and name with it. The node object
    /// keeps its identity. The two children maps are locked in address
    /// order when the parents differ.
    fn apply_rename(
        &self,
        src_parent: &Arc<Inode>,
        old_name: &str,
        dst_parent: &Arc<Inode>,
        new_name: &str,
    ) {
        let (src_dir, dst_dir) = match (src_parent.as_dir(), dst_parent.as_dir()) {
            (Some(s), Some(d)) => (s, d),
            _ => return,
        };
        let dst_path = dst_parent.path();

        let evicted = if Arc::ptr_eq(src_parent, dst_parent) {
            let mut map = src_dir.children.write().unwrap();
            match map.remove(old_name) {
                Some(child) => {
                    child.relocate(&dst_path, new_name);
                    map.insert(new_name.to_string(), child)
                }
                None => None,
            }
        } else {
            let src_first =
                src_dir as *const _ as usize <= dst_dir as *const _ as usize;
            let (mut src_map, mut dst_map) = if src_first {
                let s = src_dir.children.write().unwrap();
                let d = dst_dir.children.write().unwrap();
                (s, d)
            } else {
                let d = dst_dir.children.write().unwrap();
                let s = src_dir.children.write().unwrap();
                (s, d)
            };
            match src_map.remove(old_name) {
                Some(child) => {
                    child.relocate(&dst_path, new_name);
                    dst_map.insert(new_name.to_string(), child)
                }
                None => None,
            }
        };
        if let Some(previous) = evicted {
            self.unregister(&previous);
        }
    }

    /// Builds the visible listing of a directory from raw backing names:
    /// skip-rule entries are dropped, every entry carries the backing inode
    /// number and its lstat-derived dirent type, and exactly one `.` and
    /// one `..` are appended.
    fn assemble_dir_entries(
        &self,
        dir: &Arc<Inode>,
        kernel_ino: u64,
        names: &[String],
    ) -> Vec<(u64, FileType, String)> {
        let dir_path = dir.path();
        let mut entries = Vec::with_capacity(names.len() + 2);
        for name in names {
            if self.skip_dir_entry(name) {
                continue;
            }
            let full = join_path(&dir_path, name);
            if let Ok(st) = attr::lstat(&full) {
                entries.push((
                    st.st_ino,
                    attr::file_type_from_mode(st.st_mode as u32),
                    name.clone(),
                ));
            }
        }

        let dot_ino = attr::lstat(&dir_path)
            .map(|st| st.st_ino)
            .unwrap_or(kernel_ino);
        entries.push((dot_ino, FileType::Directory, ".".to_string()));
        let parent_path = dir.parent();
        let dotdot_ino = if parent_path.is_empty() {
            dot_ino
        } else {
            attr::lstat(&parent_path)
                .map(|st| st.st_ino)
                .unwrap_or(dot_ino)
        };
        entries.push((dotdot_ino, FileType::Directory, "..".to_string()));
        entries
    }

    fn open_common(&self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, flags, %path, "open");
        match Handle::open(&path, flags) {
            Ok(handle) => {
                let (id, size, blksize) = (handle.id(), handle.size(), handle.blksize());
                node.handles().lock().unwrap().insert(id, handle);
                self.emit(
                    who,
                    started,
                    &path,
                    node.is_dir(),
                    OpFields::Open { flags, openid: id, filesize: size, blksize },
                );
                reply.opened(id, 0);
            }
            Err(err) => {
                self.emit(
                    who,
                    started,
                    &path,
                    node.is_dir(),
                    OpFields::Open { flags, openid: 0, filesize: 0, blksize: 0 },
                );
                reply.error(errno_of(&err));
            }
        }
    }

    fn release_common(&self, req: &Request<'_>, ino: u64, fh: u64, flush: bool, reply: ReplyEmpty) {
        let Some(node) = self.node(ino) else {
            reply.ok();
            return;
        };
        let taken = node.handles().lock().unwrap().remove(&fh);
        let Some(mut handle) = taken else {
            // Releasing a handle twice is a no-op
            reply.ok();
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, fh, %path, "release");
        if flush {
            let _ = handle.sync();
        }
        let result = handle.close();
        self.emit(who, started, &path, node.is_dir(), OpFields::Close { openid: fh });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn remove_common(
        &self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        is_dir: bool,
        reply: ReplyEmpty,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(parent_node) = self.node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = join_path(&parent_node.path(), name);
        debug!(parent, name, is_dir, "remove");
        let result = if is_dir {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                self.detach_child(&parent_node, name);
                self.emit(who, started, &path, is_dir, OpFields::Unlink);
                reply.ok();
            }
            Err(err) => {
                self.emit(who, started, &path, is_dir, OpFields::Unlink);
                reply.error(errno_of(&err));
            }
        }
    }
}

fn errno_of(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Reads the entry names of an open directory descriptor, excluding the
/// `.` and `..` entries the OS reports.
fn read_dir_names(fd: libc::c_int) -> io::Result<Vec<String>> {
    let dup_fd = unsafe { libc::dup(fd) };
    if dup_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let dirp = unsafe { libc::fdopendir(dup_fd) };
    if dirp.is_null() {
        let err = io::Error::last_os_error();
        unsafe { libc::close(dup_fd) };
        return Err(err);
    }
    // The duplicated descriptor shares the directory-stream position with
    // the stored one; start every listing from the beginning.
    unsafe { libc::rewinddir(dirp) };
    let mut names = Vec::new();
    loop {
        let entry = unsafe { libc::readdir(dirp) };
        if entry.is_null() {
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        if name != "." && name != ".." {
            names.push(name);
        }
    }
    unsafe { libc::closedir(dirp) };
    Ok(names)
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for TrailFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        let mut handles = self.root.handles().lock().unwrap();
        for handle in handles.values_mut() {
            let _ = handle.close();
        }
        handles.clear();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        if self.skip_dir_entry(name) {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(parent_node) = self.node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = join_path(&parent_node.path(), name);
        debug!(parent, name, "lookup");
        match self.lookup_child(&parent_node, name) {
            Ok((_, fattr)) => {
                self.emit(
                    who,
                    started,
                    &path,
                    fattr.kind == FileType::Directory,
                    OpFields::Stat,
                );
                reply.entry(&TTL, &fattr, 0);
            }
            Err(_) => {
                self.emit(who, started, &path, false, OpFields::Stat);
                reply.error(libc::ENOENT);
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match attr::lstat(&node.path()) {
            Ok(st) => {
                let mut fattr = attr::stat_to_attr(&st);
                if ino == FUSE_ROOT_ID {
                    fattr.ino = FUSE_ROOT_ID;
                }
                reply.attr(&TTL, &fattr);
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, %path, "setattr");

        // Exactly one attribute class is applied per call, in priority
        // order; the backup, change and creation timestamps as well as the
        // BSD flags are accepted but not applied.
        let result: io::Result<()> = if let Some(at) = atime {
            attr::atime_mtime(&path).and_then(|(_, mt)| {
                attr::set_times(&path, attr::system_time_to_timespec(time_or_now(at)), mt)
            })
        } else if let Some(mt) = mtime {
            attr::atime_mtime(&path).and_then(|(at, _)| {
                attr::set_times(&path, at, attr::system_time_to_timespec(time_or_now(mt)))
            })
        } else if bkuptime.is_some() || chgtime.is_some() || crtime.is_some() || flags.is_some() {
            Ok(())
        } else if let Some(uid) = uid {
            attr::lstat(&path).and_then(|st| attr::chown(&path, uid, st.st_gid))
        } else if let Some(gid) = gid {
            attr::lstat(&path).and_then(|st| attr::chown(&path, st.st_uid, gid))
        } else if let Some(size) = size {
            attr::truncate(&path, size)
        } else if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o777))
        } else {
            Ok(())
        };

        self.emit(who, started, &path, node.is_dir(), OpFields::SetAttr);
        match result.and_then(|_| attr::lstat(&path)) {
            Ok(st) => reply.attr(&TTL, &attr::stat_to_attr(&st)),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, %path, "readlink");
        let result = std::fs::read_link(&path);
        self.emit(who, started, &path, false, OpFields::ReadLink);
        match result {
            Ok(target) => {
                use std::os::unix::ffi::OsStrExt;
                reply.data(target.as_os_str().as_bytes());
            }
            Err(err) => reply.error(errno_of(&err)),
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
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_node) = self.node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(dir) = parent_node.as_dir() else {
            reply.error(libc::ENOTDIR);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let parent_path = parent_node.path();
        let path = join_path(&parent_path, name);
        debug!(parent, name, mode, "mkdir");
        let cpath = match attr::cstring(&path) {
            Ok(c) => c,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        if unsafe { libc::mkdir(cpath.as_ptr(), mode as libc::mode_t) } != 0 {
            let err = io::Error::last_os_error();
            self.emit(who, started, &path, true, OpFields::Mkdir { mode });
            reply.error(errno_of(&err));
            return;
        }
        let newdir = Inode::new_dir(&parent_path, name);
        dir.save_entry(name, newdir.clone());
        self.emit(who, started, &path, true, OpFields::Mkdir { mode });
        match attr::lstat(&path) {
            Ok(st) => {
                let fattr = attr::stat_to_attr(&st);
                self.register(fattr.ino, &newdir);
                reply.entry(&TTL, &fattr, 0);
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_common(req, parent, name, false, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_common(req, parent, name, true, reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(name) = link_name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_node) = self.node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(dir) = parent_node.as_dir() else {
            reply.error(libc::ENOTDIR);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let parent_path = parent_node.path();
        let link_path = join_path(&parent_path, name);
        let target_str = target.to_string_lossy().into_owned();
        debug!(parent, name, target = %target_str, "symlink");

        let mut link_target = target_str.clone();
        let mut abs_target = target_str.clone();
        if REWRITE_SYMLINK_TARGETS {
            // Jail the target within the shadow tree: when an absolute
            // target points under the mount point, rewrite it to the
            // corresponding shadow path so the link survives unmounting.
            if !target.is_absolute() {
                abs_target = join_path(&parent_path, &target_str);
            }
            if abs_target.starts_with(&self.mount_dir) {
                abs_target = abs_target.replacen(&self.mount_dir, &self.shadow_dir, 1);
                link_target = abs_target.clone();
            }
        }

        // Does the link target actually exist? Failure to stat it is not
        // fatal, the link is created regardless.
        let target_is_dir = attr::lstat(&abs_target)
            .map(|st| attr::is_dir(&st))
            .unwrap_or(false);

        match std::os::unix::fs::symlink(&link_target, &link_path) {
            Ok(()) => {
                let entry = if target_is_dir {
                    Inode::new_dir(&parent_path, name)
                } else {
                    Inode::new_file(&parent_path, name)
                };
                dir.save_entry(name, entry.clone());
                self.emit(
                    who,
                    started,
                    &link_path,
                    target_is_dir,
                    OpFields::Symlink { target: target_str },
                );
                match attr::lstat(&link_path) {
                    Ok(st) => {
                        let fattr = attr::stat_to_attr(&st);
                        self.register(fattr.ino, &entry);
                        reply.entry(&TTL, &fattr, 0);
                    }
                    Err(err) => reply.error(errno_of(&err)),
                }
            }
            Err(err) => {
                self.emit(
                    who,
                    started,
                    &link_path,
                    target_is_dir,
                    OpFields::Symlink { target: target_str },
                );
                reply.error(errno_of(&err));
            }
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (Some(src), Some(dst)) = (self.node(parent), self.node(newparent)) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let old_path = join_path(&src.path(), name);
        let new_path = join_path(&dst.path(), newname);
        debug!(%old_path, %new_path, "rename");
        match std::fs::rename(&old_path, &new_path) {
            Ok(()) => {
                self.apply_rename(&src, name, &dst, newname);
                self.emit(who, started, &old_path, false, OpFields::Rename { new_path });
                reply.ok();
            }
            Err(err) => {
                self.emit(who, started, &old_path, false, OpFields::Rename { new_path });
                reply.error(errno_of(&err));
            }
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.open_common(req, ino, flags, reply);
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, fh, offset, size, "read");

        let handles = node.handles().lock().unwrap();
        let Some(handle) = handles.get(&fh) else {
            drop(handles);
            reply.error(libc::ENOTSUP);
            return;
        };
        let filesize = handle.size();
        let mut buf = vec![0u8; size as usize];
        let result = handle.read_at(&mut buf, offset.max(0) as u64);
        drop(handles);

        match result {
            Ok(n) => {
                buf.truncate(n);
                self.emit(
                    who,
                    started,
                    &path,
                    false,
                    OpFields::Read {
                        filesize,
                        position: offset,
                        bytesreq: size,
                        bytesread: n as i64,
                    },
                );
                reply.data(&buf);
            }
            Err(err) => {
                self.emit(
                    who,
                    started,
                    &path,
                    false,
                    OpFields::Read { filesize, position: offset, bytesreq: size, bytesread: -1 },
                );
                reply.error(errno_of(&err));
            }
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, fh, offset, len = data.len(), "write");

        let handles = node.handles().lock().unwrap();
        let Some(handle) = handles.get(&fh) else {
            drop(handles);
            reply.error(libc::ENOTSUP);
            return;
        };
        let result = handle.write_at(data, offset.max(0) as u64);
        drop(handles);

        match result {
            Ok(n) => {
                self.emit(
                    who,
                    started,
                    &path,
                    false,
                    OpFields::Write {
                        position: offset,
                        bytesreq: data.len(),
                        byteswritten: n as i64,
                    },
                );
                reply.written(n as u32);
            }
            Err(err) => {
                self.emit(
                    who,
                    started,
                    &path,
                    false,
                    OpFields::Write { position: offset, bytesreq: data.len(), byteswritten: -1 },
                );
                reply.error(errno_of(&err));
            }
        }
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, fh, %path, "flush");

        let mut handles = node.handles().lock().unwrap();
        let Some(handle) = handles.get_mut(&fh) else {
            drop(handles);
            reply.error(libc::ENOTSUP);
            return;
        };
        // A failed sync is reported but never invalidates the handle
        let result = handle.sync();
        drop(handles);

        self.emit(who, started, &path, node.is_dir(), OpFields::Flush);
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        self.release_common(req, ino, fh, flush, reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.open_common(req, ino, flags, reply);
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !node.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, fh, offset, %path, "readdir");

        let fd = {
            let handles = node.handles().lock().unwrap();
            match handles.get(&fh).and_then(|h| h.raw_fd()) {
                Some(fd) => fd,
                None => {
                    // Listing requires the directory handle to be open
                    reply.error(libc::ENOTSUP);
                    return;
                }
            }
        };
        let names = match read_dir_names(fd) {
            Ok(names) => names,
            Err(_) => {
                if offset == 0 {
                    self.emit(who, started, &path, true, OpFields::ReadDir { openid: fh });
                }
                reply.error(libc::EIO);
                return;
            }
        };
        let entries = self.assemble_dir_entries(&node, ino, &names);
        if offset == 0 {
            self.emit(who, started, &path, true, OpFields::ReadDir { openid: fh });
        }
        for (i, (entry_ino, kind, name)) in
            entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.release_common(req, ino, fh, false, reply);
    }

    fn statfs(&mut self, req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let who = Self::who(req);
        let started = Utc::now();
        debug!(shadow = %self.shadow_dir, "statfs");
        let result = attr::statfs(&self.shadow_dir);
        self.emit(who, started, &self.mount_dir, true, OpFields::Statfs);
        match result {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(_) => reply.error(libc::ENOTSUP),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, mask, %path, "access");
        match attr::lstat(&path).map(|st| attr::is_dir(&st)) {
            Ok(is_dir) => {
                let allowed = attr::host_access(&path, mask).unwrap_or(false);
                self.emit(who, started, &path, is_dir, OpFields::Access { mask });
                if allowed {
                    reply.ok();
                } else {
                    reply.error(libc::EACCES);
                }
            }
            Err(err) => {
                self.emit(who, started, &path, false, OpFields::Access { mask });
                reply.error(errno_of(&err));
            }
        }
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
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_node) = self.node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(dir) = parent_node.as_dir() else {
            reply.error(libc::ENOTDIR);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let parent_path = parent_node.path();
        let path = join_path(&parent_path, name);
        debug!(parent, name, mode, flags, "create");

        match Handle::create(&path, flags, mode) {
            Ok(handle) => {
                let openid = handle.id();
                match attr::lstat(&path) {
                    Ok(st) => {
                        let fattr = attr::stat_to_attr(&st);
                        let newfile = Inode::new_file(&parent_path, name);
                        newfile.handles().lock().unwrap().insert(openid, handle);
                        dir.save_entry(name, newfile.clone());
                        self.register(fattr.ino, &newfile);
                        self.emit(
                            who,
                            started,
                            &path,
                            false,
                            OpFields::Creat { flags, perm: mode, openid },
                        );
                        reply.created(&TTL, &fattr, 0, openid, 0);
                    }
                    Err(err) => {
                        // The descriptor is dropped and nothing is installed
                        self.emit(
                            who,
                            started,
                            &path,
                            false,
                            OpFields::Creat { flags, perm: mode, openid },
                        );
                        reply.error(errno_of(&err));
                    }
                }
            }
            Err(err) => {
                self.emit(
                    who,
                    started,
                    &path,
                    false,
                    OpFields::Creat { flags, perm: mode, openid: 0 },
                );
                reply.error(errno_of(&err));
            }
        }
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, name, "getxattr");
        let result = attr::xattr_get(&path, name);
        self.emit(
            who,
            started,
            &path,
            node.is_dir(),
            OpFields::GetXattr { name: name.to_string() },
        );
        match result {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, name, len = value.len(), "setxattr");
        let result = attr::xattr_set(&path, name, value, flags);
        self.emit(
            who,
            started,
            &path,
            node.is_dir(),
            OpFields::SetXattr { name: name.to_string() },
        );
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, size, "listxattr");
        let result = attr::xattr_list(&path);
        self.emit(who, started, &path, node.is_dir(), OpFields::ListXattr { size });
        match result {
            Ok(list) => {
                if size == 0 {
                    reply.size(list.len() as u32);
                } else if list.len() <= size as usize {
                    reply.data(&list);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let who = Self::who(req);
        let started = Utc::now();
        let path = node.path();
        debug!(ino, name, "removexattr");
        // When the attribute is absent the call succeeds silently
        let result = if attr::xattr_exists(&path, name) {
            attr::xattr_remove(&path, name)
        } else {
            Ok(())
        };
        self.emit(
            who,
            started,
            &path,
            node.is_dir(),
            OpFields::RemoveXattr { name: name.to_string() },
        );
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }
}

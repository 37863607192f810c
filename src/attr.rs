// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::ffi::CString;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

pub fn cstring(path: &str) -> io::Result<CString> {
    CString::new(path).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

pub fn lstat(path: &str) -> io::Result<libc::stat> {
    let cpath = cstring(path)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::lstat(cpath.as_ptr(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

pub fn is_dir(st: &libc::stat) -> bool {
    st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFDIR as u32
}

fn timespec_to_system_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
    }
}

#[cfg(target_os = "macos")]
fn creation_time(st: &libc::stat) -> SystemTime {
    timespec_to_system_time(st.st_birthtime, st.st_birthtime_nsec)
}

#[cfg(not(target_os = "macos"))]
fn creation_time(st: &libc::stat) -> SystemTime {
    timespec_to_system_time(st.st_ctime, st.st_ctime_nsec)
}

/// Maps backing file system metadata into the kernel-visible attribute shape.
pub fn stat_to_attr(st: &libc::stat) -> FileAttr {
    FileAttr {
        ino: st.st_ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: timespec_to_system_time(st.st_atime, st.st_atime_nsec),
        mtime: timespec_to_system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: timespec_to_system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: creation_time(st),
        kind: file_type_from_mode(st.st_mode as u32),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

/// Resolves a stat mode to the dirent type reported to the kernel.
pub fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// File system statistics for the statfs reply, taken from the shadow root.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[cfg(target_os = "linux")]
pub fn statfs(path: &str) -> io::Result<FsStats> {
    let cpath = cstring(path)?;
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut buf) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FsStats {
        blocks: buf.f_blocks as u64,
        bfree: buf.f_bfree as u64,
        bavail: buf.f_bavail as u64,
        files: buf.f_files as u64,
        ffree: buf.f_ffree as u64,
        bsize: buf.f_bsize as u32,
        namelen: buf.f_namelen as u32,
        frsize: buf.f_frsize as u32,
    })
}

#[cfg(target_os = "macos")]
pub fn statfs(path: &str) -> io::Result<FsStats> {
    let cpath = cstring(path)?;
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut buf) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FsStats {
        blocks: buf.f_blocks,
        bfree: buf.f_bfree,
        bavail: buf.f_bavail,
        files: buf.f_files,
        ffree: buf.f_ffree,
        bsize: buf.f_bsize,
        namelen: 255,
        frsize: buf.f_bsize,
    })
}

pub fn atime_mtime(path: &str) -> io::Result<(libc::timespec, libc::timespec)> {
    let st = lstat(path)?;
    Ok((
        libc::timespec { tv_sec: st.st_atime, tv_nsec: st.st_atime_nsec },
        libc::timespec { tv_sec: st.st_mtime, tv_nsec: st.st_mtime_nsec },
    ))
}

pub fn system_time_to_timespec(t: SystemTime) -> libc::timespec {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        },
        Err(_) => libc::timespec { tv_sec: 0, tv_nsec: 0 },
    }
}

pub fn set_times(path: &str, atime: libc::timespec, mtime: libc::timespec) -> io::Result<()> {
    let cpath = cstring(path)?;
    let times = [atime, mtime];
    if unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn chown(path: &str, uid: u32, gid: u32) -> io::Result<()> {
    let cpath = cstring(path)?;
    if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn truncate(path: &str, size: u64) -> io::Result<()> {
    let cpath = cstring(path)?;
    if unsafe { libc::truncate(cpath.as_ptr(), size as libc::off_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn host_access(path: &str, mask: i32) -> io::Result<bool> {
    let cpath = cstring(path)?;
    Ok(unsafe { libc::access(cpath.as_ptr(), mask) } == 0)
}

// Extended attributes. The backing calls follow the probe-then-fetch
// pattern: a zero-length first call obtains the value size, a second call
// fills an allocated buffer.

#[cfg(target_os = "linux")]
pub const ENO_XATTR: libc::c_int = libc::ENODATA;
#[cfg(target_os = "macos")]
pub const ENO_XATTR: libc::c_int = libc::ENOATTR;

#[cfg(target_os = "linux")]
fn getxattr_raw(path: &CString, name: &CString, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(target_os = "macos")]
fn getxattr_raw(path: &CString, name: &CString, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            0,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(target_os = "linux")]
fn listxattr_raw(path: &CString, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::listxattr(
            path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(target_os = "macos")]
fn listxattr_raw(path: &CString, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::listxattr(
            path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            0,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn xattr_get(path: &str, name: &str) -> io::Result<Vec<u8>> {
    let cpath = cstring(path)?;
    let cname = cstring(name)?;
    let size = getxattr_raw(&cpath, &cname, &mut [])
        .map_err(|_| io::Error::from_raw_os_error(ENO_XATTR))?;
    if size == 0 {
        return Err(io::Error::from_raw_os_error(ENO_XATTR));
    }
    let mut buf = vec![0u8; size];
    let n = getxattr_raw(&cpath, &cname, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

pub fn xattr_exists(path: &str, name: &str) -> bool {
    match (cstring(path), cstring(name)) {
        (Ok(cpath), Ok(cname)) => getxattr_raw(&cpath, &cname, &mut []).is_ok(),
        _ => false,
    }
}

pub fn xattr_list(path: &str) -> io::Result<Vec<u8>> {
    let cpath = cstring(path)?;
    let size = match listxattr_raw(&cpath, &mut []) {
        Ok(0) | Err(_) => return Ok(Vec::new()),
        Ok(n) => n,
    };
    let mut buf = vec![0u8; size];
    let n = listxattr_raw(&cpath, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(target_os = "linux")]
pub fn xattr_set(path: &str, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
    let cpath = cstring(path)?;
    let cname = cstring(name)?;
    let rc = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn xattr_set(path: &str, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
    let cpath = cstring(path)?;
    let cname = cstring(name)?;
    let rc = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
            flags as u32,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn xattr_remove(path: &str, name: &str) -> io::Result<()> {
    let cpath = cstring(path)?;
    let cname = cstring(name)?;
    if unsafe { libc::removexattr(cpath.as_ptr(), cname.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn xattr_remove(path: &str, name: &str) -> io::Result<()> {
    let cpath = cstring(path)?;
    let cname = cstring(name)?;
    if unsafe { libc::removexattr(cpath.as_ptr(), cname.as_ptr(), 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lstat_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"abcdef").unwrap();
        let st = lstat(path.to_str().unwrap()).unwrap();
        let attr = stat_to_attr(&st);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 6);
        assert!(attr.ino > 0);
        assert!(attr.blksize > 0);
        assert!(!is_dir(&st));
    }

    #[test]
    fn lstat_directory() {
        let dir = tempfile::tempdir().unwrap();
        let st = lstat(dir.path().to_str().unwrap()).unwrap();
        assert!(is_dir(&st));
        assert_eq!(stat_to_attr(&st).kind, FileType::Directory);
    }

    #[test]
    fn lstat_missing_path_is_not_found() {
        let err = lstat("/no/such/trailfs/path").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn symlink_keeps_link_type() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/nonexistent/target", &link).unwrap();
        let st = lstat(link.to_str().unwrap()).unwrap();
        assert_eq!(stat_to_attr(&st).kind, FileType::Symlink);
    }

    #[test]
    fn dirent_type_mapping() {
        assert_eq!(file_type_from_mode(libc::S_IFDIR as u32), FileType::Directory);
        assert_eq!(file_type_from_mode(libc::S_IFLNK as u32), FileType::Symlink);
        assert_eq!(file_type_from_mode(libc::S_IFREG as u32), FileType::RegularFile);
        assert_eq!(file_type_from_mode(libc::S_IFIFO as u32), FileType::NamedPipe);
        assert_eq!(file_type_from_mode(libc::S_IFSOCK as u32), FileType::Socket);
    }

    #[test]
    fn statfs_reports_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let stats = statfs(dir.path().to_str().unwrap()).unwrap();
        assert!(stats.bsize > 0);
        assert!(stats.blocks > 0);
    }

    #[test]
    fn access_existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(host_access(dir.path().to_str().unwrap(), libc::F_OK).unwrap());
        assert!(!host_access("/no/such/trailfs/path", libc::F_OK).unwrap());
    }

    #[test]
    fn truncate_changes_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow");
        std::fs::write(&path, b"xyz").unwrap();
        truncate(path.to_str().unwrap(), 1).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1);
        truncate(path.to_str().unwrap(), 10).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn interior_nul_is_invalid() {
        let err = lstat("bad\0path").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}

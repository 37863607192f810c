// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::{OnceLock, RwLock};

fn user_store() -> &'static RwLock<HashMap<u32, String>> {
    static STORE: OnceLock<RwLock<HashMap<u32, String>>> = OnceLock::new();
    STORE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn group_store() -> &'static RwLock<HashMap<u32, String>> {
    static STORE: OnceLock<RwLock<HashMap<u32, String>>> = OnceLock::new();
    STORE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn proc_store() -> &'static RwLock<HashMap<u32, String>> {
    static STORE: OnceLock<RwLock<HashMap<u32, String>>> = OnceLock::new();
    STORE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn cached(store: &RwLock<HashMap<u32, String>>, id: u32, resolve: fn(u32) -> String) -> String {
    if let Some(name) = store.read().unwrap().get(&id) {
        return name.clone();
    }
    let name = resolve(id);
    store.write().unwrap().insert(id, name.clone());
    name
}

/// Returns the login name for a user id, or an empty string when the id
/// cannot be resolved. Results are cached for the lifetime of the process.
pub fn user_name(uid: u32) -> String {
    cached(user_store(), uid, uid_to_user_name)
}

/// Returns the group name for a group id, or an empty string when the id
/// cannot be resolved. Results are cached for the lifetime of the process.
pub fn group_name(gid: u32) -> String {
    cached(group_store(), gid, gid_to_group_name)
}

/// Returns the executable path of a process, or an empty string when it
/// cannot be retrieved. Entries are cached for the lifetime of the process,
/// so a reused pid may briefly report the previous executable.
pub fn process_path(pid: u32) -> String {
    cached(proc_store(), pid, os_process_path)
}

fn uid_to_user_name(uid: u32) -> String {
    let mut buf = vec![0i8; 1024];
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return String::new();
        }
        return unsafe { CStr::from_ptr(pwd.pw_name) }
            .to_string_lossy()
            .into_owned();
    }
}

fn gid_to_group_name(gid: u32) -> String {
    let mut buf = vec![0i8; 1024];
    loop {
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrgid_r(
                gid,
                &mut grp,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return String::new();
        }
        return unsafe { CStr::from_ptr(grp.gr_name) }
            .to_string_lossy()
            .into_owned();
    }
}

#[cfg(target_os = "linux")]
fn os_process_path(pid: u32) -> String {
    // /proc/<pid>/exe is a symbolic link to the executable
    if let Ok(path) = std::fs::read_link(format!("/proc/{pid}/exe")) {
        let path = path.to_string_lossy().into_owned();
        if path.starts_with('/') {
            return path;
        }
    }

    // Fall back to the first NUL-delimited argument in /proc/<pid>/cmdline
    let Ok(buffer) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return String::new();
    };
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

#[cfg(not(target_os = "linux"))]
fn os_process_path(_pid: u32) -> String {
    String::new()
}

#[cfg(test)]
pub fn reset() {
    user_store().write().unwrap().clear();
    group_store().write().unwrap().clear();
    proc_store().write().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_resolve_to_empty() {
        assert_eq!(user_name(u32::MAX - 1), "");
        assert_eq!(group_name(u32::MAX - 1), "");
        // Cached on the second call as well
        assert_eq!(user_name(u32::MAX - 1), "");
    }

    #[test]
    fn lookups_are_stable_across_calls() {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        assert_eq!(user_name(uid), user_name(uid));
        assert_eq!(group_name(gid), group_name(gid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_process_path_is_absolute() {
        let path = process_path(std::process::id());
        assert!(path.starts_with('/'), "got {path:?}");
        assert_eq!(path, process_path(std::process::id()));
    }

    #[test]
    fn reset_clears_cached_entries() {
        let _ = user_name(u32::MAX - 2);
        assert!(user_store().read().unwrap().contains_key(&(u32::MAX - 2)));
        reset();
        assert!(!user_store().read().unwrap().contains_key(&(u32::MAX - 2)));
    }
}

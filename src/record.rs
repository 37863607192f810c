// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};

use crate::ident;

/// Identity of the process which requested the file I/O operation,
/// captured when the request entered the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Information shared by all traceable file system operations.
#[derive(Clone, Debug)]
pub struct Header {
    pub who: ProcessInfo,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub path: String,
    pub is_dir: bool,
}

/// Operation-specific trace payload. The variant determines the operation
/// type token used in both serializations.
#[derive(Clone, Debug)]
pub enum OpFields {
    Open { flags: i32, openid: u64, filesize: u64, blksize: u32 },
    Read { filesize: u64, position: i64, bytesreq: u32, bytesread: i64 },
    Write { position: i64, bytesreq: usize, byteswritten: i64 },
    Flush,
    Close { openid: u64 },
    Mkdir { mode: u32 },
    Unlink,
    Creat { flags: i32, perm: u32, openid: u64 },
    Symlink { target: String },
    Stat,
    ReadDir { openid: u64 },
    Statfs,
    Rename { new_path: String },
    ReadLink,
    Access { mask: i32 },
    SetAttr,
    ListXattr { size: u32 },
    GetXattr { name: String },
    RemoveXattr { name: String },
    SetXattr { name: String },
}

impl OpFields {
    pub fn op_type(&self) -> &'static str {
        match self {
            OpFields::Open { .. } => "open",
            OpFields::Read { .. } => "read",
            OpFields::Write { .. } => "write",
            OpFields::Flush => "flush",
            OpFields::Close { .. } => "close",
            OpFields::Mkdir { .. } => "mkdir",
            OpFields::Unlink => "unlink",
            OpFields::Creat { .. } => "creat",
            OpFields::Symlink { .. } => "symlink",
            OpFields::Stat => "stat",
            OpFields::ReadDir { .. } => "readdir",
            OpFields::Statfs => "statfs",
            OpFields::Rename { .. } => "rename",
            OpFields::ReadLink => "readlink",
            OpFields::Access { .. } => "access",
            OpFields::SetAttr => "setattr",
            OpFields::ListXattr { .. } => "listxattr",
            OpFields::GetXattr { .. } => "getxattr",
            OpFields::RemoveXattr { .. } => "removexattr",
            OpFields::SetXattr { .. } => "setxattr",
        }
    }
}

/// One trace event. Immutable once populated; only the end timestamp is
/// stamped between construction and emission.
#[derive(Clone, Debug)]
pub struct Record {
    pub hdr: Header,
    pub op: OpFields,
}

impl Record {
    pub fn new(
        who: ProcessInfo,
        start: DateTime<Utc>,
        path: impl Into<String>,
        is_dir: bool,
        op: OpFields,
    ) -> Record {
        Record {
            hdr: Header {
                who,
                start,
                end: start,
                path: path.into(),
                is_dir,
            },
            op,
        }
    }

    pub fn set_time_end(&mut self) {
        self.hdr.end = Utc::now();
    }

    pub fn elapsed_ns(&self) -> i64 {
        (self.hdr.end - self.hdr.start).num_nanoseconds().unwrap_or(0)
    }

    fn header_json(&self) -> Value {
        let who = self.hdr.who;
        json!({
            "uid": who.uid,
            "usr": ident::user_name(who.uid),
            "gid": who.gid,
            "grp": ident::group_name(who.gid),
            "pid": who.pid,
            "proc": ident::process_path(who.pid),
            "start": format_time(&self.hdr.start),
            "end": format_time(&self.hdr.end),
            "nselaps": self.elapsed_ns(),
        })
    }

    pub fn to_json(&self) -> Value {
        let t = self.op.op_type();
        let path = &self.hdr.path;
        let isdir = self.hdr.is_dir;
        let op = match &self.op {
            OpFields::Open { flags, openid, filesize, blksize } => json!({
                "type": t, "path": path, "isdir": isdir,
                "flags": flags_string(*flags),
                "perm": perm_string(*flags as u32),
                "openid": openid, "filesize": filesize, "blksize": blksize,
            }),
            OpFields::Read { filesize, position, bytesreq, bytesread } => json!({
                "type": t, "path": path, "isdir": isdir,
                "filesize": filesize, "position": position,
                "bytesreq": bytesreq, "bytesread": bytesread,
            }),
            OpFields::Write { position, bytesreq, byteswritten } => json!({
                "type": t, "path": path, "isdir": isdir,
                "position": position, "bytesreq": bytesreq,
                "byteswritten": byteswritten,
            }),
            OpFields::Creat { flags, perm, openid } => json!({
                "type": t, "path": path, "isdir": isdir,
                "flags": flags_string(*flags),
                "perm": perm_string(*perm),
                "openid": openid,
            }),
            OpFields::Close { openid } | OpFields::ReadDir { openid } => json!({
                "type": t, "path": path, "isdir": isdir, "openid": openid,
            }),
            OpFields::Mkdir { mode } => json!({
                "type": t, "path": path, "isdir": isdir, "mode": perm_string(*mode),
            }),
            OpFields::Symlink { target } => json!({
                "type": t, "path": path, "isdir": isdir, "target": target,
            }),
            OpFields::Rename { new_path } => json!({
                "type": t, "isdir": isdir, "old": path, "new": new_path,
            }),
            OpFields::Access { mask } => json!({
                "type": t, "path": path, "isdir": isdir,
                "mode": access_mode_string(*mask),
            }),
            OpFields::ListXattr { size } => json!({
                "type": t, "path": path, "isdir": isdir, "size": size,
            }),
            OpFields::GetXattr { name }
            | OpFields::RemoveXattr { name }
            | OpFields::SetXattr { name } => json!({
                "type": t, "path": path, "isdir": isdir, "name": name,
            }),
            OpFields::Flush
            | OpFields::Unlink
            | OpFields::Stat
            | OpFields::Statfs
            | OpFields::ReadLink
            | OpFields::SetAttr => json!({
                "type": t, "path": path, "isdir": isdir,
            }),
        };
        json!({ "hdr": self.header_json(), "op": op })
    }

    /// Serializes the record as an ordered list of CSV fields: the common
    /// header columns followed by the operation-specific columns.
    pub fn to_csv(&self) -> Vec<String> {
        let who = self.hdr.who;
        let mut fields = Vec::with_capacity(16);
        fields.push(format_time(&self.hdr.start));
        fields.push(format_time(&self.hdr.end));
        fields.push(self.elapsed_ns().to_string());
        fields.push(ident::user_name(who.uid));
        fields.push(who.uid.to_string());
        fields.push(ident::group_name(who.gid));
        fields.push(who.gid.to_string());
        fields.push(ident::process_path(who.pid));
        fields.push(who.pid.to_string());
        fields.push(self.hdr.path.clone());
        let isdir = if self.hdr.is_dir { "dir" } else { "file" };
        fields.push(isdir.to_string());
        fields.push(self.op.op_type().to_string());
        match &self.op {
            OpFields::Open { flags, openid, filesize, blksize } => {
                fields.push(flags_string(*flags));
                fields.push(perm_string(*flags as u32));
                fields.push(openid.to_string());
                fields.push(filesize.to_string());
                fields.push(blksize.to_string());
            }
            OpFields::Read { filesize, position, bytesreq, bytesread } => {
                fields.push(filesize.to_string());
                fields.push(position.to_string());
                fields.push(bytesreq.to_string());
                fields.push(bytesread.to_string());
            }
            OpFields::Write { position, bytesreq, byteswritten } => {
                fields.push(position.to_string());
                fields.push(bytesreq.to_string());
                fields.push(byteswritten.to_string());
            }
            OpFields::Creat { flags, perm, openid } => {
                fields.push(flags_string(*flags));
                fields.push(perm_string(*perm));
                fields.push(openid.to_string());
            }
            OpFields::Close { openid } | OpFields::ReadDir { openid } => {
                fields.push(openid.to_string());
            }
            OpFields::Mkdir { mode } => fields.push(perm_string(*mode)),
            OpFields::Symlink { target } => fields.push(target.clone()),
            OpFields::Rename { new_path } => fields.push(new_path.clone()),
            OpFields::Access { mask } => fields.push(access_mode_string(*mask).to_string()),
            OpFields::ListXattr { size } => fields.push(size.to_string()),
            OpFields::GetXattr { name }
            | OpFields::RemoveXattr { name }
            | OpFields::SetXattr { name } => fields.push(name.clone()),
            OpFields::Flush
            | OpFields::Unlink
            | OpFields::Stat
            | OpFields::Statfs
            | OpFields::ReadLink
            | OpFields::SetAttr => {}
        }
        fields
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Renders permission bits as four-digit zero-padded octal, e.g. `0644`.
pub fn perm_string(mode: u32) -> String {
    format!("0{:03o}", mode & 0o777)
}

fn open_mode_string(flags: i32) -> String {
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => "O_RDONLY".to_string(),
        libc::O_WRONLY => "O_WRONLY".to_string(),
        libc::O_RDWR => "O_RDWR".to_string(),
        other => format!("unknown mode [{other:x}]"),
    }
}

const OPEN_FLAG_NAMES: [(i32, &str); 5] = [
    (libc::O_CREAT, "O_CREAT"),
    (libc::O_EXCL, "O_EXCL"),
    (libc::O_TRUNC, "O_TRUNC"),
    (libc::O_APPEND, "O_APPEND"),
    (libc::O_SYNC, "O_SYNC"),
];

/// Renders open flags as the access mode followed by any modifier flags,
/// joined by `|`, e.g. `O_WRONLY|O_CREAT|O_TRUNC`.
pub fn flags_string(flags: i32) -> String {
    let mut parts = vec![open_mode_string(flags)];
    let mask = flags & !libc::O_ACCMODE;
    for (bit, name) in OPEN_FLAG_NAMES {
        if mask & bit == bit {
            parts.push(name.to_string());
        }
    }
    parts.join("|")
}

/// Renders an access(2) mask as one of `F_OK`, `X_OK`, `W_OK`, `R_OK`.
pub fn access_mode_string(mask: i32) -> &'static str {
    match mask & 0x7 {
        0 => "F_OK",
        1 => "X_OK",
        2 => "W_OK",
        4 => "R_OK",
        _ => "unknown",
    }
}

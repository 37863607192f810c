// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::handle::Handle;

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        Path::new(parent).join(name).to_string_lossy().into_owned()
    }
}

/// Where a node lives inside the shadow tree. The path is always the join
/// of parent and name; both are updated together, only under rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub parent: String,
    pub name: String,
    pub path: String,
}

impl Location {
    pub fn new(parent: &str, name: &str) -> Location {
        Location {
            parent: parent.to_string(),
            name: name.to_string(),
            path: join_path(parent, name),
        }
    }
}

#[derive(Debug)]
pub struct FileNode {
    pub loc: RwLock<Location>,
    pub ino: InodeNumber,
    pub handles: Mutex<HashMap<u64, Handle>>,
}

#[derive(Debug)]
pub struct DirNode {
    pub loc: RwLock<Location>,
    pub ino: InodeNumber,
    pub handles: Mutex<HashMap<u64, Handle>>,
    // entries maps the name of a node to its node object
    pub children: RwLock<HashMap<String, Arc<Inode>>>,
}

impl DirNode {
    /// Associates a file or directory object with a name in this directory,
    /// returning any entry it replaced.
    pub fn save_entry(&self, name: &str, entry: Arc<Inode>) -> Option<Arc<Inode>> {
        self.children.write().unwrap().insert(name.to_string(), entry)
    }

    /// Deletes and returns the object associated with a name, if any.
    pub fn drop_entry(&self, name: &str) -> Option<Arc<Inode>> {
        self.children.write().unwrap().remove(name)
    }

    /// Returns the object currently associated with a name, if any.
    pub fn get_entry(&self, name: &str) -> Option<Arc<Inode>> {
        self.children.read().unwrap().get(name).cloned()
    }
}

/// One named entry under the shadow directory.
#[derive(Debug)]
pub enum Inode {
    File(FileNode),
    Dir(DirNode),
}

impl Inode {
    pub fn new_file(parent: &str, name: &str) -> Arc<Inode> {
        Arc::new(Inode::File(FileNode {
            loc: RwLock::new(Location::new(parent, name)),
            ino: InodeNumber::default(),
            handles: Mutex::new(HashMap::new()),
        }))
    }

    pub fn new_dir(parent: &str, name: &str) -> Arc<Inode> {
        Arc::new(Inode::Dir(DirNode {
            loc: RwLock::new(Location::new(parent, name)),
            ino: InodeNumber::default(),
            handles: Mutex::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
        }))
    }

    pub fn loc(&self) -> &RwLock<Location> {
        match self {
            Inode::File(f) => &f.loc,
            Inode::Dir(d) => &d.loc,
        }
    }

    pub fn handles(&self) -> &Mutex<HashMap<u64, Handle>> {
        match self {
            Inode::File(f) => &f.handles,
            Inode::Dir(d) => &d.handles,
        }
    }

    pub fn ino(&self) -> &InodeNumber {
        match self {
            Inode::File(f) => &f.ino,
            Inode::Dir(d) => &d.ino,
        }
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match self {
            Inode::Dir(d) => Some(d),
            Inode::File(_) => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Inode::Dir(_))
    }

    pub fn path(&self) -> String {
        self.loc().read().unwrap().path.clone()
    }

    pub fn parent(&self) -> String {
        self.loc().read().unwrap().parent.clone()
    }

    /// Moves the node to a new parent and name, updating parent, name and
    /// path together.
    pub fn relocate(&self, parent: &str, name: &str) {
        *self.loc().write().unwrap() = Location::new(parent, name);
    }
}

// The inode number under which the kernel addresses a node. Stored beside
// the node registry so unlink and rename can evict stale registrations.
#[derive(Debug, Default)]
pub struct InodeNumber(AtomicU64);

impl InodeNumber {
    pub fn set(&self, ino: u64) {
        self.0.store(ino, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_joins_parent_and_name() {
        let loc = Location::new("/shadow/docs", "a.txt");
        assert_eq!(loc.path, "/shadow/docs/a.txt");
        assert_eq!(loc.parent, "/shadow/docs");
        assert_eq!(loc.name, "a.txt");
    }

    #[test]
    fn root_location_has_empty_parent() {
        let loc = Location::new("", "/shadow");
        assert_eq!(loc.path, "/shadow");
        assert_eq!(loc.name, "/shadow");
    }

    #[test]
    fn save_get_drop_entry() {
        let dir = Inode::new_dir("", "/shadow");
        let d = dir.as_dir().unwrap();
        let child = Inode::new_file("/shadow", "x.txt");
        assert!(d.save_entry("x.txt", child.clone()).is_none());
        let got = d.get_entry("x.txt").unwrap();
        assert!(Arc::ptr_eq(&got, &child));
        let dropped = d.drop_entry("x.txt").unwrap();
        assert!(Arc::ptr_eq(&dropped, &child));
        assert!(d.get_entry("x.txt").is_none());
        assert!(d.drop_entry("x.txt").is_none());
    }

    #[test]
    fn save_entry_returns_replaced_node() {
        let dir = Inode::new_dir("", "/shadow");
        let d = dir.as_dir().unwrap();
        let first = Inode::new_file("/shadow", "n");
        let second = Inode::new_file("/shadow", "n");
        d.save_entry("n", first.clone());
        let prev = d.save_entry("n", second.clone()).unwrap();
        assert!(Arc::ptr_eq(&prev, &first));
        assert!(Arc::ptr_eq(&d.get_entry("n").unwrap(), &second));
    }

    #[test]
    fn relocate_updates_parent_name_and_path_together() {
        let node = Inode::new_file("/shadow/a", "old.txt");
        node.relocate("/shadow/b", "new.txt");
        let loc = node.loc().read().unwrap().clone();
        assert_eq!(loc.parent, "/shadow/b");
        assert_eq!(loc.name, "new.txt");
        assert_eq!(loc.path, "/shadow/b/new.txt");
    }

    #[test]
    fn rename_between_maps_preserves_identity() {
        let src = Inode::new_dir("", "/shadow/src");
        let dst = Inode::new_dir("", "/shadow/dst");
        let child = Inode::new_file("/shadow/src", "f");
        src.as_dir().unwrap().save_entry("f", child.clone());

        let moved = src.as_dir().unwrap().drop_entry("f").unwrap();
        moved.relocate(&dst.path(), "g");
        dst.as_dir().unwrap().save_entry("g", moved.clone());

        assert!(src.as_dir().unwrap().get_entry("f").is_none());
        let found = dst.as_dir().unwrap().get_entry("g").unwrap();
        assert!(Arc::ptr_eq(&found, &child));
        assert_eq!(found.path(), "/shadow/dst/g");
    }
}

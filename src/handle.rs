// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::sync::atomic::{AtomicU64, Ordering};

// Handle ids are process-wide: strictly positive, monotonically
// increasing, never reused within a process lifetime.
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// State of one open file or directory: the backing descriptor, the open
/// flags supplied by the kernel, and a size/block-size snapshot taken at
/// open or sync time. While `file` is present the handle is open; closing
/// clears both the descriptor and the id.
#[derive(Debug)]
pub struct Handle {
    id: u64,
    file: Option<File>,
    flags: i32,
    size: u64,
    blksize: u32,
}

fn access_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        m if m == libc::O_WRONLY => opts.write(true),
        m if m == libc::O_RDWR => opts.read(true).write(true),
        _ => opts.read(true),
    };
    opts
}

impl Handle {
    /// Opens the backing path using only the access-mode bits of the kernel
    /// flags. The size and block size are captured by fstat on the freshly
    /// opened descriptor.
    pub fn open(path: &str, flags: i32) -> io::Result<Handle> {
        let file = access_options(flags).open(path)?;
        let meta = file.metadata()?;
        Ok(Handle {
            id: next_handle_id(),
            file: Some(file),
            flags,
            size: meta.size(),
            blksize: meta.blksize() as u32,
        })
    }

    /// Atomically creates and opens the backing path with the full kernel
    /// flag set and the requested mode.
    pub fn create(path: &str, flags: i32, mode: u32) -> io::Result<Handle> {
        let mut opts = access_options(flags);
        opts.create(true)
            .mode(mode)
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT));
        let file = opts.open(path)?;
        let meta = file.metadata()?;
        Ok(Handle {
            id: next_handle_id(),
            file: Some(file),
            flags,
            size: 0,
            blksize: meta.blksize() as u32,
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blksize(&self) -> u32 {
        self.blksize
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    fn file(&self) -> io::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Positional read. Reads until the buffer is full or the descriptor
    /// reports end of file; a short or empty result is not an error.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = self.file()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Positional write of the whole buffer.
    pub fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.file()?.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Flushes the descriptor to stable storage and refreshes the cached
    /// size from a fresh fstat.
    pub fn sync(&mut self) -> io::Result<()> {
        let file = self.file()?;
        file.sync_all()?;
        self.size = file.metadata()?.size();
        Ok(())
    }

    /// Closes the backing descriptor and clears the handle id. Closing an
    /// already-closed handle is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            self.id = 0;
            let fd = file.into_raw_fd();
            if unsafe { libc::close(fd) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn handle_ids_are_unique_and_monotonic() {
        let mut threads = Vec::new();
        for _ in 0..4 {
            threads.push(std::thread::spawn(|| {
                let mut ids = Vec::with_capacity(200);
                for _ in 0..200 {
                    ids.push(next_handle_id());
                }
                ids
            }));
        }
        let mut seen = HashSet::new();
        for t in threads {
            let ids = t.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(id > 0);
                assert!(seen.insert(id), "handle id {id} reused");
            }
        }
    }

    #[test]
    fn open_captures_size_and_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello").unwrap();
        let handle = Handle::open(path.to_str().unwrap(), libc::O_RDONLY).unwrap();
        assert!(handle.is_open());
        assert!(handle.id() > 0);
        assert_eq!(handle.size(), 5);
        assert!(handle.blksize() > 0);
        assert_eq!(handle.flags(), libc::O_RDONLY);
    }

    #[test]
    fn read_at_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, b"hi\n").unwrap();
        let handle = Handle::open(path.to_str().unwrap(), libc::O_RDONLY).unwrap();
        let mut buf = vec![0u8; 4096];
        assert_eq!(handle.read_at(&mut buf, 0).unwrap(), 3);
        assert_eq!(&buf[..3], b"hi\n");
        // Reading at the end of file yields zero bytes, not an error
        assert_eq!(handle.read_at(&mut buf, 3).unwrap(), 0);
    }

    #[test]
    fn create_then_write_and_sync_refreshes_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.txt");
        let mut handle = Handle::create(
            path.to_str().unwrap(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o644,
        )
        .unwrap();
        assert_eq!(handle.size(), 0);
        assert_eq!(handle.write_at(b"data\n", 0).unwrap(), 5);
        handle.sync().unwrap();
        assert_eq!(handle.size(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"data\n");
    }

    #[test]
    fn close_clears_descriptor_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");
        std::fs::write(&path, b"x").unwrap();
        let mut handle = Handle::open(path.to_str().unwrap(), libc::O_RDONLY).unwrap();
        handle.close().unwrap();
        assert!(!handle.is_open());
        assert_eq!(handle.id(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(
            handle.read_at(&mut buf, 0).unwrap_err().raw_os_error(),
            Some(libc::EBADF)
        );
        // Double close is tolerated
        handle.close().unwrap();
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        let err = Handle::open(path.to_str().unwrap(), libc::O_RDONLY).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn directories_can_be_opened() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Handle::open(dir.path().to_str().unwrap(), libc::O_RDONLY).unwrap();
        assert!(handle.raw_fd().is_some());
    }
}

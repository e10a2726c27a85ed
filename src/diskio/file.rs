use libc::{c_void, fstat, off_t, pread, pwrite};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SortError};
use crate::resources::{FileSlot, Resources};

/// How a run file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Read and write an existing file.
    Update,
    /// Create if missing and keep existing contents.
    Write,
    /// Create if missing and drop existing contents.
    Truncate,
}

pub struct SharedFd {
    fd: RawFd,
    path: PathBuf,
}

impl SharedFd {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Update => options.read(true).write(true),
            OpenMode::Write => options.read(true).write(true).create(true),
            OpenMode::Truncate => options.read(true).write(true).create(true).truncate(true),
        };
        let file = options.open(path.as_ref())?;
        Ok(Self {
            fd: file.into_raw_fd(),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> io::Result<u64> {
        file_size_fd(self.fd)
    }

    pub fn truncate(&self, len: u64) -> io::Result<()> {
        truncate_fd(self.fd, len)
    }
}

impl Drop for SharedFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// An open run file registered with the file manager for as long as it lives.
pub struct FileHandle {
    fd: SharedFd,
    _slot: FileSlot,
}

impl FileHandle {
    pub fn open(resources: &Arc<Resources>, path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let slot = resources.acquire_file()?;
        let fd = SharedFd::open(path.as_ref(), mode)
            .map_err(|e| SortError::io(path.as_ref(), 0, e))?;
        Ok(Self { fd, _slot: slot })
    }

    pub fn fd(&self) -> &SharedFd {
        &self.fd
    }

    pub fn path(&self) -> &Path {
        self.fd.path()
    }
}

pub fn file_size_fd(fd: RawFd) -> io::Result<u64> {
    let mut stat_buf: libc::stat = unsafe { std::mem::zeroed() };

    let result = unsafe { fstat(fd, &mut stat_buf) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(stat_buf.st_size as u64)
    }
}

pub fn truncate_fd(fd: RawFd, len: u64) -> io::Result<()> {
    let result = unsafe { libc::ftruncate(fd, len as off_t) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Reads at `offset` without moving the file position. A short count means
/// end of file.
pub fn pread_fd(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let result = unsafe {
        pread(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            offset as off_t,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

pub fn pwrite_fd(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    let result = unsafe {
        pwrite(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            offset as off_t,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Writes the whole buffer at `offset`, retrying short and interrupted writes.
pub fn pwrite_all_fd(fd: RawFd, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match pwrite_fd(fd, buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "pwrite wrote zero bytes",
                ));
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Enforcement;
    use tempfile::tempdir;

    #[test]
    fn test_positioned_io_and_truncate() {
        let dir = tempdir().unwrap();
        let fd = SharedFd::open(dir.path().join("run"), OpenMode::Truncate).unwrap();
        pwrite_all_fd(fd.as_raw_fd(), b"hello world", 0).unwrap();
        pwrite_all_fd(fd.as_raw_fd(), b"W", 6).unwrap();

        let mut buf = [0u8; 32];
        let n = pread_fd(fd.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello World");

        fd.truncate(5).unwrap();
        assert_eq!(fd.size().unwrap(), 5);
        assert_eq!(pread_fd(fd.as_raw_fd(), &mut buf, 5).unwrap(), 0);
    }

    #[test]
    fn test_file_handle_counts_against_file_manager() {
        let dir = tempdir().unwrap();
        let resources = Resources::new(usize::MAX, 1, Enforcement::Throw);
        let handle = FileHandle::open(&resources, dir.path().join("a"), OpenMode::Truncate).unwrap();
        assert_eq!(resources.files().used(), 1);

        let second = FileHandle::open(&resources, dir.path().join("b"), OpenMode::Truncate);
        assert!(matches!(second, Err(SortError::OutOfFiles { .. })));

        drop(handle);
        assert_eq!(resources.files().used(), 0);
    }

    #[test]
    fn test_failed_open_releases_slot() {
        let dir = tempdir().unwrap();
        let resources = Resources::unlimited();
        let missing = FileHandle::open(&resources, dir.path().join("missing"), OpenMode::Read);
        assert!(matches!(missing, Err(SortError::Io { .. })));
        assert_eq!(resources.files().used(), 0);
    }
}

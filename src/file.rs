//! Positional file access shared by the file engines, flat record streams and line search.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Result, Status};

/// A file read and written at explicit offsets.
///
/// Every method takes `&self`; concurrent writers to disjoint ranges are safe. The logical size
/// is tracked in memory so that appends can reserve space without a lock.
#[derive(Debug)]
pub struct File {
    inner: fs::File,
    path: PathBuf,
    size: AtomicU64,
    writable: bool,
}

/// Flags for [`File::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOpenFlags {
    /// Discard existing content.
    pub truncate: bool,
    /// Fail if the file does not exist.
    pub no_create: bool,
}

impl File {
    /// Opens a file, creating it when writable unless `no_create` is set.
    pub fn open(path: impl AsRef<Path>, writable: bool, flags: FileOpenFlags) -> Result<File> {
        let path = path.as_ref();
        let inner = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable && !flags.no_create)
            .truncate(writable && flags.truncate)
            .open(path)
            .map_err(|err| {
                Status::new(Status::from(err).code(), format!("{}: cannot open", path.display()))
            })?;
        let size = inner.metadata()?.len();
        Ok(File {
            inner,
            path: path.to_path_buf(),
            size: AtomicU64::new(size),
            writable,
        })
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Whether the file accepts writes.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Fails with `INFEASIBLE_ERROR` if the range reaches past the end of the file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset.saturating_add(buf.len() as u64);
        if end > self.size() {
            return Err(Status::infeasible(format!(
                "excessive read: {} > {}",
                end,
                self.size()
            )));
        }
        read_exact_at(&self.inner, buf, offset)?;
        Ok(())
    }

    /// Reads `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads up to `max_len` bytes at `offset`, fewer at the end of the file.
    pub fn read_some(&self, offset: u64, max_len: usize) -> Result<Vec<u8>> {
        let available = self.size().saturating_sub(offset).min(max_len as u64) as usize;
        self.read(offset, available)
    }

    /// Writes `data` at `offset`, growing the file if needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        write_all_at(&self.inner, data, offset)?;
        self.size
            .fetch_max(offset + data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Reserves `len` bytes at the end of the file and returns their offset.
    ///
    /// The space is claimed atomically; the bytes are written later by [`File::write_at`].
    pub fn reserve(&self, len: u64) -> Result<u64> {
        self.check_writable()?;
        Ok(self.size.fetch_add(len, Ordering::AcqRel))
    }

    /// Appends `data` and returns the offset where it landed.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let offset = self.reserve(data.len() as u64)?;
        write_all_at(&self.inner, data, offset)?;
        Ok(offset)
    }

    /// Sets the file size, zero-filling when it grows.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.check_writable()?;
        self.inner.set_len(size)?;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    /// Flushes to the device when `hard`, and trims any reserved tail that was never written.
    pub fn synchronize(&self, hard: bool) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let logical = self.size();
        if self.inner.metadata()?.len() != logical {
            self.inner.set_len(logical)?;
        }
        if hard {
            self.inner.sync_all()?;
        }
        Ok(())
    }

    /// Reads the whole file split into lines without their terminators.
    pub fn read_lines(&self) -> Result<Vec<Vec<u8>>> {
        let data = self.read(0, self.size() as usize)?;
        let mut lines: Vec<Vec<u8>> = data
            .split(|byte| *byte == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
            .collect();
        if data.ends_with(b"\n") || data.is_empty() {
            lines.pop();
        }
        Ok(lines)
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Status::precondition(format!(
                "{}: not writable",
                self.path.display()
            )))
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &fs::File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &fs::File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &fs::File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset)? {
            0 => return Err(std::io::ErrorKind::WriteZero.into()),
            n => {
                data = &data[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn positional_io() {
        let dir = TempDir::new().unwrap();
        let file = File::open(dir.path().join("data"), true, FileOpenFlags::default()).unwrap();
        assert_eq!(0, file.append(b"hello").unwrap());
        assert_eq!(5, file.append(b"world").unwrap());
        file.write_at(3, b"LO").unwrap();
        assert_eq!(b"helLOworld".to_vec(), file.read(0, 10).unwrap());
        assert_eq!(
            crate::StatusCode::InfeasibleError,
            file.read(8, 5).unwrap_err().code()
        );
        assert_eq!(b"ld".to_vec(), file.read_some(8, 5).unwrap());
        file.truncate(4).unwrap();
        assert_eq!(4, file.size());
        file.synchronize(true).unwrap();
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        File::open(&path, true, FileOpenFlags::default()).unwrap().append(b"a\nbc\n").unwrap();
        let file = File::open(&path, false, FileOpenFlags::default()).unwrap();
        assert_eq!(vec![b"a".to_vec(), b"bc".to_vec()], file.read_lines().unwrap());
        assert_eq!(
            crate::StatusCode::PreconditionError,
            file.append(b"x").unwrap_err().code()
        );
        let missing = File::open(
            dir.path().join("missing"),
            true,
            FileOpenFlags {
                no_create: true,
                ..Default::default()
            },
        );
        assert_eq!(crate::StatusCode::NotFoundError, missing.unwrap_err().code());
    }
}

//! EINTR-safe POSIX file primitives.
//!
//! Every method asserts the descriptor is still open and retries the
//! underlying syscall on `EINTR`, the way a blocking single-threaded engine
//! must: a partial retry loop here is cheaper than teaching every caller to
//! cope with spurious interruption.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use snafu::{IntoError, ResultExt};

use crate::error::{ClosedSnafu, IoSnafu, PosixError};

/// A single gather-write segment for [`PosixFile::writev`].
pub struct IoSlice<'a>(pub &'a [u8]);

/// A file opened read-write at `dir/name`, with EINTR-safe blocking I/O.
pub struct PosixFile {
    file: Option<File>,
    path: PathBuf,
}

impl PosixFile {
    /// Opens (creating if necessary) `dir/name` for read-write access.
    pub fn open(dir: &Path, name: &str) -> Result<Self, PosixError> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .context(IoSnafu {
                path: path.clone(),
                op: "open",
            })?;
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self, op: &'static str) -> Result<&File, PosixError> {
        self.file.as_ref().ok_or_else(|| {
            ClosedSnafu {
                path: self.path.clone(),
                op,
            }
            .build()
        })
    }

    /// Current size of the file.
    pub fn len(&self) -> Result<u64, PosixError> {
        Ok(self
            .file("len")?
            .metadata()
            .context(IoSnafu {
                path: self.path.clone(),
                op: "fstat",
            })?
            .len())
    }

    /// `pread(2)`: read starting at `offset`, retrying on `EINTR`, looping
    /// until `buf` is filled or EOF is hit.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, PosixError> {
        let file = self.file("pread")?;
        let mut read = 0usize;
        while read < buf.len() {
            match file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(IoSnafu {
                        path: self.path.clone(),
                        op: "pread",
                    }
                    .into_error(e))
                }
            }
        }
        Ok(read)
    }

    /// `pwrite(2)`: write starting at `offset`, retrying on `EINTR` and
    /// short writes until all of `buf` lands.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<(), PosixError> {
        let file = self.file("pwrite")?;
        let mut written = 0usize;
        while written < buf.len() {
            match file.write_at(&buf[written..], offset + written as u64) {
                Ok(0) => {
                    return Err(IoSnafu {
                        path: self.path.clone(),
                        op: "pwrite",
                    }
                    .into_error(io::Error::new(io::ErrorKind::WriteZero, "wrote 0 bytes")))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(IoSnafu {
                        path: self.path.clone(),
                        op: "pwrite",
                    }
                    .into_error(e))
                }
            }
        }
        Ok(())
    }

    /// `writev(2)` gather-write at the current file-end position, tracking a
    /// byte cursor across slices so a short write resumes from the right
    /// spot instead of re-sending bytes already on disk.
    pub fn writev(&self, slices: &[IoSlice<'_>], offset: u64) -> Result<(), PosixError> {
        let file = self.file("writev")?;
        let fd = file.as_raw_fd();
        let total: usize = slices.iter().map(|s| s.0.len()).sum();
        let mut done = 0usize;
        let iovecs: Vec<libc::iovec> = slices
            .iter()
            .map(|s| libc::iovec {
                iov_base: s.0.as_ptr() as *mut libc::c_void,
                iov_len: s.0.len(),
            })
            .collect();
        let mut cur_offset = offset;
        while done < total {
            // Skip/trim iovecs already fully/partially consumed by a prior
            // short write.
            let mut remaining = done;
            let mut start = 0;
            while remaining > 0 && start < iovecs.len() {
                let len = iovecs[start].iov_len;
                if remaining >= len {
                    remaining -= len;
                    start += 1;
                } else {
                    break;
                }
            }
            let mut working: Vec<libc::iovec> = iovecs[start..].to_vec();
            if remaining > 0 {
                let base = working[0].iov_base as *mut u8;
                working[0].iov_base = unsafe { base.add(remaining) } as *mut libc::c_void;
                working[0].iov_len -= remaining;
            }
            let n = unsafe {
                libc::pwritev(
                    fd,
                    working.as_ptr(),
                    working.len() as libc::c_int,
                    cur_offset as libc::off_t,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(IoSnafu {
                    path: self.path.clone(),
                    op: "writev",
                }
                .into_error(err));
            }
            done += n as usize;
            cur_offset += n as u64;
        }
        Ok(())
    }

    /// Truncates the file to zero length.
    pub fn reset(&self) -> Result<(), PosixError> {
        self.file("ftruncate")?
            .set_len(0)
            .context(IoSnafu {
                path: self.path.clone(),
                op: "ftruncate",
            })
    }

    /// `ftruncate(2)` to an arbitrary length.
    pub fn truncate_to(&self, len: u64) -> Result<(), PosixError> {
        self.file("ftruncate")?
            .set_len(len)
            .context(IoSnafu {
                path: self.path.clone(),
                op: "ftruncate",
            })
    }

    /// `fdatasync(2)`.
    pub fn flush(&self) -> Result<(), PosixError> {
        let file = self.file("fdatasync")?;
        let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if ret != 0 {
            return Err(IoSnafu {
                path: self.path.clone(),
                op: "fdatasync",
            }
            .into_error(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Closes the descriptor. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// `unlink(2)` the path, then close.
    pub fn remove(mut self) -> Result<(), PosixError> {
        std::fs::remove_file(&self.path).context(IoSnafu {
            path: self.path.clone(),
            op: "unlink",
        })?;
        self.close();
        Ok(())
    }

    pub fn raw_fd(&self) -> Result<std::os::unix::io::RawFd, PosixError> {
        Ok(self.file("fd")?.as_raw_fd())
    }
}

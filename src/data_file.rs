//! The overflow data file: append + random-update I/O, head truncation, and
//! zero-range.

use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use snafu::IntoError;

use crate::error::{IoSnafu, PosixError};
use crate::posix::{IoSlice, PosixFile};

/// Head truncation always removes a whole multiple of this many bytes.
pub const COLLAPSE_CHUNK: u64 = 1024 * 1024;

/// Wraps [`PosixFile`] with the `fallocate(2)` modes the data file needs.
pub struct DataFile {
    inner: PosixFile,
    /// Result of the one-time capability probe: whether the
    /// kernel/filesystem underneath this data directory supports
    /// `FALLOC_FL_COLLAPSE_RANGE`. Gates all head-truncation attempts.
    pub collapse_range_supported: bool,
}

impl DataFile {
    pub fn open(dir: &Path, name: &str) -> Result<Self, PosixError> {
        let inner = PosixFile::open(dir, name)?;
        let collapse_range_supported = probe_collapse_range_support(dir).unwrap_or(false);
        Ok(Self {
            inner,
            collapse_range_supported,
        })
    }

    pub fn len(&self) -> Result<u64, PosixError> {
        self.inner.len()
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, PosixError> {
        self.inner.pread(buf, offset)
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<(), PosixError> {
        self.inner.pwrite(buf, offset)
    }

    pub fn writev(&self, slices: &[IoSlice<'_>], offset: u64) -> Result<(), PosixError> {
        self.inner.writev(slices, offset)
    }

    pub fn reset(&self) -> Result<(), PosixError> {
        self.inner.reset()
    }

    pub fn flush(&self) -> Result<(), PosixError> {
        self.inner.flush()
    }

    pub fn close(&mut self) {
        self.inner.close()
    }

    pub fn remove(self) -> Result<(), PosixError> {
        self.inner.remove()
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Grows the file's allocation to at least `offset + len` without
    /// changing reported contents beyond what's written.
    pub fn allocate(&self, offset: u64, len: u64) -> Result<(), PosixError> {
        self.fallocate(0, offset, len)
    }

    /// Fills `[offset, offset+len)` with zero bytes without changing the
    /// file's length.
    pub fn zero_range(&self, offset: u64, len: u64) -> Result<(), PosixError> {
        self.fallocate(libc::FALLOC_FL_ZERO_RANGE, offset, len)
    }

    /// Removes a whole-MiB-multiple prefix of the file via
    /// `FALLOC_FL_COLLAPSE_RANGE`. Returns the number of bytes actually
    /// removed (rounded down to a multiple of [`COLLAPSE_CHUNK`]; `0` if
    /// collapse-range isn't supported or `requested` rounds down to 0).
    pub fn collapse_head(&self, requested: u64) -> Result<u64, PosixError> {
        if !self.collapse_range_supported {
            return Ok(0);
        }
        let amount = (requested / COLLAPSE_CHUNK) * COLLAPSE_CHUNK;
        if amount == 0 {
            return Ok(0);
        }
        self.fallocate(libc::FALLOC_FL_COLLAPSE_RANGE, 0, amount)?;
        Ok(amount)
    }

    fn fallocate(&self, mode: libc::c_int, offset: u64, len: u64) -> Result<(), PosixError> {
        let fd = self.inner.raw_fd()?;
        let ret = unsafe {
            libc::fallocate(fd, mode, offset as libc::off_t, len as libc::off_t)
        };
        if ret != 0 {
            return Err(IoSnafu {
                path: self.inner.path().to_path_buf(),
                op: "fallocate",
            }
            .into_error(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Runs the `collapse_range` capability probe: creates an
/// anonymous temp file in `dir`, allocates 1 MiB + 100 B, attempts to
/// collapse the first MiB away, and checks the resulting size is exactly
/// 100 B.
fn probe_collapse_range_support(dir: &Path) -> io::Result<bool> {
    let template = dir.join(".qdiskmq-probe-XXXXXX");
    let template_str = template
        .to_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-utf8 data dir"))?;
    let mut buf: Vec<u8> = template_str.bytes().chain(std::iter::once(0)).collect();

    let fd = unsafe { libc::mkstemp(buf.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Ok(false);
    }
    let path = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .into_owned();

    let probe_len = COLLAPSE_CHUNK + 100;
    let result = (|| -> io::Result<bool> {
        let ret = unsafe { libc::fallocate(fd, 0, 0, probe_len as libc::off_t) };
        if ret != 0 {
            return Ok(false);
        }
        let ret = unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_COLLAPSE_RANGE,
                0,
                COLLAPSE_CHUNK as libc::off_t,
            )
        };
        if ret != 0 {
            return Ok(false);
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        if ret != 0 {
            return Ok(false);
        }
        Ok(stat.st_size as u64 == 100)
    })();

    unsafe {
        libc::close(fd);
    }
    let _ = std::fs::remove_file(&path);

    result
}

//! Memory-mapped regions
//!
//! A [`Region`] is a read/write `MAP_SHARED` mapping, either backed by a
//! POSIX shared memory object or anonymous (tests, in-process tools).
//! Accessors are bounds and alignment checked against the mapping length.

use std::ffi::CString;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::ShmError;

enum Backing {
    /// Named object; `owner` is set when this mapping created the object and
    /// unlinks the name on drop
    Named { fd: libc::c_int, c_name: CString, owner: bool },
    Anonymous,
}

/// A shared read/write memory mapping
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the mapping lives until drop, and every access goes through atomics
// or raw byte copies that tolerate concurrent writers in another process.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Normalise a session-level name into a POSIX shm object name
fn object_name(name: &str) -> Result<CString, ShmError> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.len() > 250 {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    CString::new(format!("/{trimmed}")).map_err(|_| ShmError::InvalidName(name.to_string()))
}

fn object_size(fd: libc::c_int) -> io::Result<usize> {
    // SAFETY: zeroed stat is a valid out-parameter for fstat.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

fn map(fd: libc::c_int, len: usize, flags: libc::c_int) -> io::Result<NonNull<u8>> {
    // SAFETY: a null hint with a valid fd (or -1 for anonymous) is always a legal request.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::Other))
}

impl Region {
    /// Create the named object if missing (sized to `len`) or open the existing one
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        Self::open_named(name, len, true)
    }

    /// Attach to an existing named object of at least `len` bytes
    pub fn open(name: &str, len: usize) -> Result<Self, ShmError> {
        Self::open_named(name, len, false)
    }

    fn open_named(name: &str, len: usize, create: bool) -> Result<Self, ShmError> {
        let c_name = object_name(name)?;
        let shm_open = |oflag: libc::c_int| {
            // SAFETY: c_name is a valid NUL-terminated string.
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o600 as libc::c_uint) };
            if fd < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        };

        // Only the process whose O_EXCL open succeeded owns the name
        let opened = if create {
            match shm_open(libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) {
                Ok(fd) => Ok((fd, true)),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    shm_open(libc::O_RDWR).map(|fd| (fd, false))
                }
                Err(e) => Err(e),
            }
        } else {
            shm_open(libc::O_RDWR).map(|fd| (fd, false))
        };
        let (fd, owner) = opened.map_err(|source| ShmError::Open {
            name: name.to_string(),
            source,
        })?;

        let close = |err: ShmError| {
            // SAFETY: fd was returned by shm_open above and is not used afterwards.
            unsafe { libc::close(fd) };
            err
        };

        let actual = object_size(fd).map_err(|source| {
            close(ShmError::Open {
                name: name.to_string(),
                source,
            })
        })?;

        if actual == 0 && create {
            // SAFETY: fd is a valid, writable shm descriptor.
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                return Err(close(ShmError::Open {
                    name: name.to_string(),
                    source: io::Error::last_os_error(),
                }));
            }
        } else if actual < len {
            return Err(close(ShmError::TooSmall {
                name: name.to_string(),
                actual,
                expected: len,
            }));
        }

        let ptr = map(fd, len, libc::MAP_SHARED).map_err(|source| {
            close(ShmError::Map {
                name: name.to_string(),
                source,
            })
        })?;

        Ok(Self {
            ptr,
            len,
            backing: Backing::Named { fd, c_name, owner },
        })
    }

    /// Zero-filled mapping that is not reachable by name
    pub fn anonymous(len: usize) -> Result<Self, ShmError> {
        let ptr = map(-1, len, libc::MAP_SHARED | libc::MAP_ANONYMOUS).map_err(|source| {
            ShmError::Map {
                name: "<anonymous>".to_string(),
                source,
            }
        })?;
        Ok(Self {
            ptr,
            len,
            backing: Backing::Anonymous,
        })
    }

    /// Mapping length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn checked(&self, offset: usize, size: usize, align: usize) -> *mut u8 {
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.len),
            "shared memory access {offset}+{size} outside {} byte region",
            self.len
        );
        assert_eq!(offset % align, 0, "misaligned shared memory access at {offset}");
        // SAFETY: bounds checked above.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// 32-bit atomic cell at `offset`
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        let ptr = self.checked(offset, 4, 4);
        // SAFETY: in bounds, 4-byte aligned (mmap is page aligned), valid for the region lifetime.
        unsafe { &*(ptr as *const AtomicU32) }
    }

    /// 64-bit atomic cell at `offset`
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        let ptr = self.checked(offset, 8, 8);
        // SAFETY: in bounds, 8-byte aligned, valid for the region lifetime.
        unsafe { &*(ptr as *const AtomicU64) }
    }

    /// Copy `dst.len()` bytes starting at `offset`
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        let src = self.checked(offset, dst.len(), 1);
        // SAFETY: source range checked; dst is a distinct Rust allocation.
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }

    /// Copy `src` into the region at `offset`
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let dst = self.checked(offset, src.len(), 1);
        // SAFETY: destination range checked; src is a distinct Rust allocation.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in the constructor.
        unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if let Backing::Named { fd, c_name, owner } = &self.backing {
            // SAFETY: fd is owned by this region.
            unsafe { libc::close(*fd) };
            if *owner {
                // SAFETY: c_name is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }
}

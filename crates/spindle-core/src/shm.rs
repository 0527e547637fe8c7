//! Anonymous shared-memory segments.
//!
//! On Linux this uses `memfd_create`; elsewhere it falls back to
//! `shm_open` + immediate `shm_unlink`. Segments are always mapped at their
//! full size so that logical growth (tracked by the arena's committed
//! counter) never relocates bytes.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// A shared memory segment.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    _fd: OwnedFd,
}

// Safety: the mapping lives until Drop; all concurrent access goes through
// atomics or is serialized by the single-producer/single-consumer protocol.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new anonymous shared memory segment of `size` bytes,
    /// zero-filled.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let fd = Self::create_fd(name)?;

        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(SharedMemory {
            ptr: NonNull::new(ptr as *mut u8)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?,
            len: size,
            _fd: fd,
        })
    }

    #[cfg(target_os = "linux")]
    fn create_fd(name: &str) -> io::Result<OwnedFd> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;

        let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(not(target_os = "linux"))]
    fn create_fd(name: &str) -> io::Result<OwnedFd> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let unique_name = format!("/spindle-{}-{}-{}", std::process::id(), seq, name);
        let c_name = CString::new(unique_name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Immediately unlink so the segment is anonymous.
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View an `AtomicU32` at `offset` bytes into the segment.
    ///
    /// # Panics
    /// If the offset is out of bounds or not 4-byte aligned.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.len && offset % 4 == 0);
        // SAFETY: in bounds, aligned, and the mapping outlives `self`.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Read `len` bytes at `offset`.
    ///
    /// # Safety
    /// Caller must ensure no concurrent writes to the range. The ring
    /// protocol guarantees this: a slot's bytes are only read by the side
    /// that currently owns the slot bit.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len)
    }

    /// Write access to `len` bytes at `offset`.
    ///
    /// # Safety
    /// Caller must have exclusive ownership of the range under the ring
    /// protocol.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn create_and_write() {
        let shm = SharedMemory::create("test-rw", 4096).unwrap();
        unsafe {
            shm.bytes_mut(0, 2).copy_from_slice(&[42, 43]);
            assert_eq!(shm.bytes(0, 2), &[42, 43]);
        }
        assert_eq!(shm.len(), 4096);
    }

    #[test]
    fn starts_zeroed() {
        let shm = SharedMemory::create("test-zero", 4096).unwrap();
        let all = unsafe { shm.bytes(0, 4096) };
        assert!(all.iter().all(|&b| b == 0));
    }

    #[test]
    fn atomic_view() {
        let shm = SharedMemory::create("test-atomic", 4096).unwrap();
        let word = shm.atomic_u32(64);
        word.store(0xfeed, Ordering::Release);
        assert_eq!(shm.atomic_u32(64).load(Ordering::Acquire), 0xfeed);
    }

    #[test]
    #[should_panic]
    fn atomic_view_out_of_bounds() {
        let shm = SharedMemory::create("test-oob", 64).unwrap();
        let _ = shm.atomic_u32(64);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page-aligned transfer buffers.

use std::ops::Deref;
use std::ops::DerefMut;

const PAGE_SIZE: usize = 4096;

/// A zero-initialized, page-aligned buffer backed by an anonymous mapping.
pub struct PageBuffer {
    ptr: *mut u8,
    len: usize,
    mapped: usize,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for PageBuffer {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    /// Allocates a `len` byte buffer. `len` must be non-zero.
    pub fn new(len: usize) -> std::io::Result<Self> {
        if len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "buffer length must be non-zero",
            ));
        }
        let mapped = len.checked_next_multiple_of(PAGE_SIZE).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "buffer too large")
        })?;
        // SAFETY: No file descriptor or address is being passed.
        // The result is being validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            ptr: addr.cast(),
            len,
            mapped,
        })
    }
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the mapping is at least `len` bytes, readable, and
        // initialized by the kernel.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the mapping is writable and uniquely owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // SAFETY: The address and length are a valid mmap result.
        unsafe {
            libc::munmap(self.ptr.cast(), self.mapped);
        }
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! User-mode access to the FPGA memory device node and to the FPGA's PCIe
//! BAR.

#![cfg(target_os = "linux")]
// UNSAFETY: Manual memory management with mmap and device ioctls.
#![expect(unsafe_code)]

pub mod bar;

use fpgamem_defs::CacheOp;
use fpgamem_defs::DEVICE_PATH;
use fpgamem_defs::FPGA_MEMORY_BASE;
use fpgamem_defs::PAGE_SIZE;
use libc::c_void;
use nix::errno::Errno;
use std::os::unix::prelude::*;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open device")]
    Open(#[source] std::io::Error),
    #[error("invalid mapping length {len:#x}")]
    InvalidLength { len: usize },
    #[error("failed to map {len:#x} bytes at {addr:#x}")]
    Map {
        addr: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("cache maintenance ioctl {op} failed")]
    Ioctl {
        op: CacheOp,
        #[source]
        source: Errno,
    },
}

/// An open handle to the FPGA memory device node.
pub struct FpgaMemDevice {
    file: fs_err::File,
}

impl FpgaMemDevice {
    /// Opens `/dev/fpgamem`.
    pub fn open() -> Result<Self, Error> {
        Self::open_path(DEVICE_PATH)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(Error::Open)?;
        Ok(Self { file })
    }

    /// Maps the first `len` bytes of the window at the window's own physical
    /// base, so that virtual and physical addresses coincide.
    pub fn map(&self, len: usize) -> Result<FpgaMapping, Error> {
        self.map_at(FPGA_MEMORY_BASE, len, 0)
    }

    /// Maps `len` bytes of the window, starting `pgoff` pages in, at the
    /// virtual address `addr`.
    ///
    /// Fails rather than replacing anything already mapped there.
    pub fn map_at(&self, addr: u64, len: usize, pgoff: u64) -> Result<FpgaMapping, Error> {
        let offset = pgoff
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::InvalidLength { len })?;
        map_shared(self.file.file().as_fd(), Some(addr), len, offset)
    }

    /// Issues the cache maintenance operation `op` on `arg` through the
    /// device ioctl.
    ///
    /// # Safety
    ///
    /// `arg` must be a valid operand for `op`. Invalidating operations
    /// discard dirty lines, so the caller must own any memory they touch.
    pub unsafe fn cache_op(&self, op: CacheOp, arg: u64) -> Result<(), Error> {
        tracing::trace!(%op, arg, "cache maintenance ioctl");
        // SAFETY: the file descriptor is valid and the operand is passed by
        // value. The caller guarantees the operation itself is sound.
        let r = unsafe { libc::ioctl(self.file.file().as_raw_fd(), op as u32 as _, arg) };
        Errno::result(r).map_err(|source| Error::Ioctl { op, source })?;
        Ok(())
    }
}

impl AsFd for FpgaMemDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.file().as_fd()
    }
}

pub(crate) fn map_shared(
    fd: BorrowedFd<'_>,
    addr: Option<u64>,
    len: usize,
    offset: u64,
) -> Result<FpgaMapping, Error> {
    if len == 0 || len as u64 % PAGE_SIZE != 0 {
        return Err(Error::InvalidLength { len });
    }
    let mut flags = libc::MAP_SHARED;
    if addr.is_some() {
        flags |= libc::MAP_FIXED_NOREPLACE;
    }
    let hint = addr.unwrap_or(0);
    let map_err = |source| Error::Map {
        addr: hint,
        len,
        source,
    };
    // SAFETY: the file descriptor is valid, and MAP_FIXED_NOREPLACE never
    // replaces an existing mapping. The result is being validated.
    let ptr = unsafe {
        libc::mmap(
            hint as *mut c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd.as_raw_fd(),
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(map_err(std::io::Error::last_os_error()));
    }
    let mapping = FpgaMapping { addr: ptr, len };
    // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
    if addr.is_some_and(|addr| ptr as u64 != addr) {
        drop(mapping);
        return Err(map_err(std::io::Error::from_raw_os_error(libc::EEXIST)));
    }
    tracing::debug!(addr = ptr as u64, len, offset, "mapped device memory");
    Ok(mapping)
}

/// A shared mapping of device memory, unmapped on drop.
pub struct FpgaMapping {
    addr: *mut c_void,
    len: usize,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for FpgaMapping {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for FpgaMapping {}

impl FpgaMapping {
    pub fn as_ptr(&self) -> *mut c_void {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        assert_eq!(offset % 8, 0);
        assert!(offset.saturating_add(8) <= self.len);
        // SAFETY: We have validated that the offset is inside the region.
        unsafe { std::ptr::read_volatile(self.addr.byte_add(offset).cast()) }
    }

    pub fn write_u64(&self, offset: usize, data: u64) {
        assert_eq!(offset % 8, 0);
        assert!(offset.saturating_add(8) <= self.len);
        // SAFETY: We have validated that the offset is inside the region.
        unsafe {
            std::ptr::write_volatile(self.addr.byte_add(offset).cast(), data);
        }
    }
}

impl Drop for FpgaMapping {
    fn drop(&mut self) {
        // SAFETY: The address and length are a valid mmap result.
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

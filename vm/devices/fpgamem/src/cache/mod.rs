// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache and TLB maintenance requested through the device ioctl.
//!
//! The operations map one-to-one onto processor-specific instructions, so the
//! backend is chosen when the crate is built. Building for an architecture
//! without a backend is an error, unless the `host-cache` feature (or a test
//! build) asks for the no-op [`HostCache`](host::HostCache) instead.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(all(not(target_arch = "aarch64"), any(test, feature = "host-cache")))]
mod host;

#[cfg(not(any(target_arch = "aarch64", test, feature = "host-cache")))]
compile_error!("fpgamem: no cache maintenance backend for this target architecture");

#[cfg(target_arch = "aarch64")]
pub use aarch64::ThunderxCache as NativeCache;
#[cfg(all(not(target_arch = "aarch64"), any(test, feature = "host-cache")))]
pub use host::HostCache as NativeCache;

use fpgamem_defs::CacheOp;
use fpgamem_defs::OpcodeError;
use thiserror::Error;

/// Error returned by a [`CacheMaintenance`] backend.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("{0} has no equivalent on this processor")]
    NotCapable(CacheOp),
}

/// Error returned from the device ioctl.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IoctlError {
    #[error("invalid ioctl command")]
    InvalidArgument(#[source] OpcodeError),
    #[error("cache maintenance failed")]
    Cache(#[source] CacheError),
}

impl IoctlError {
    /// The errno reported to user mode.
    pub fn errno(&self) -> i32 {
        match self {
            IoctlError::InvalidArgument(_) => libc::EINVAL,
            IoctlError::Cache(CacheError::NotCapable(_)) => libc::EOPNOTSUPP,
        }
    }
}

/// A processor's cache and TLB maintenance primitives.
pub trait CacheMaintenance: Send + Sync {
    /// Issues the instruction for `op` with operand `arg`.
    ///
    /// # Safety
    ///
    /// `arg` must be valid for `op` under the processor's addressing rules (a
    /// set/way index or a mapped address), and the caller must be running at
    /// a privilege level that may issue the instruction. Invalidating without
    /// writeback discards dirty data, so the caller must also own whatever
    /// memory the operation touches.
    unsafe fn apply(&self, op: CacheOp, arg: u64) -> Result<(), CacheError>;
}

/// Decodes an ioctl command word and applies it through `cache`.
///
/// # Safety
///
/// See [`CacheMaintenance::apply`].
pub unsafe fn dispatch<C: CacheMaintenance + ?Sized>(
    cache: &C,
    cmd: u32,
    arg: u64,
) -> Result<(), IoctlError> {
    let op = CacheOp::try_from(cmd).map_err(IoctlError::InvalidArgument)?;
    tracing::trace!(%op, arg, "cache maintenance");
    // SAFETY: guaranteed by caller.
    unsafe { cache.apply(op, arg) }.map_err(IoctlError::Cache)
}

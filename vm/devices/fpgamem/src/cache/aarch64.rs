// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cavium ThunderX (Enzian) L2 cache and TLB maintenance.
//!
//! These are implementation-defined `SYS #0, C11, Cn, #op2, Xt` instructions
//! and are only accepted at EL1 and above.

use super::CacheError;
use super::CacheMaintenance;
use fpgamem_defs::CacheOp;
use std::arch::asm;

/// ThunderX maintenance backend.
#[derive(Debug, Default, Copy, Clone)]
pub struct ThunderxCache;

macro_rules! sys {
    ($template:literal, $arg:expr) => {
        // SAFETY: guaranteed by the caller of `apply`.
        unsafe { asm!($template, in(reg) $arg, options(nostack, preserves_flags)) }
    };
}

impl CacheMaintenance for ThunderxCache {
    unsafe fn apply(&self, op: CacheOp, arg: u64) -> Result<(), CacheError> {
        match op {
            // CVMCACHEWBIL2I
            CacheOp::IndexWritebackInvalidate => sys!("sys #0, c11, c0, #5, {0}", arg),
            // CVMCACHEWBL2I
            CacheOp::IndexWriteback => sys!("sys #0, c11, c0, #6, {0}", arg),
            // CVMCACHELTGL2I
            CacheOp::IndexLoadTag => sys!("sys #0, c11, c0, #7, {0}", arg),
            // CVMCACHESTGL2I
            CacheOp::IndexStoreTag => sys!("sys #0, c11, c1, #0, {0}", arg),
            // CVMCACHEINVL2
            CacheOp::HitInvalidate => sys!("sys #0, c11, c1, #1, {0}", arg),
            // CVMCACHEWBIL2
            CacheOp::HitWritebackInvalidate => sys!("sys #0, c11, c1, #2, {0}", arg),
            // CVMCACHEWBL2
            CacheOp::HitWriteback => sys!("sys #0, c11, c1, #3, {0}", arg),
            // CVMCACHELCKL2
            CacheOp::FetchAndLock => sys!("sys #0, c11, c1, #4, {0}", arg),
            // CVMCACHERDUTLB
            CacheOp::ReadMicroTlb => sys!("sys #0, c11, c1, #5, {0}", arg),
            // CVMCACHERDMTLB
            CacheOp::ReadMainTlb => sys!("sys #0, c11, c1, #6, {0}", arg),
            // CVMCACHEPREFUTLB
            CacheOp::PrefetchMicroTlb => sys!("sys #0, c11, c2, #0, {0}", arg),
        }
        Ok(())
    }
}

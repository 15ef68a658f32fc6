// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stand-in backend for building and testing the driver away from the FPGA
//! host. Every operation is accepted and nothing is issued.

use super::CacheError;
use super::CacheMaintenance;
use fpgamem_defs::CacheOp;

/// Backend that accepts every operation without touching the processor.
#[derive(Debug, Default, Copy, Clone)]
pub struct HostCache;

impl CacheMaintenance for HostCache {
    unsafe fn apply(&self, op: CacheOp, arg: u64) -> Result<(), CacheError> {
        tracing::trace!(%op, arg, "cache maintenance skipped on host");
        Ok(())
    }
}

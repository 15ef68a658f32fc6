// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The physically contiguous device-memory window and the pure part of fault
//! resolution.

use fpgamem_defs::EntrySize;
use fpgamem_defs::PAGE_SHIFT;
use thiserror::Error;

/// Error constructing a [`MappedRegion`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("region length must be non-zero")]
    Empty,
    #[error("region base {base:#x} is not aligned to {granularity:?}")]
    MisalignedBase { base: u64, granularity: EntrySize },
    #[error("region length {len:#x} is not a multiple of {granularity:?}")]
    MisalignedLength { len: u64, granularity: EntrySize },
    #[error("region {base:#x}+{len:#x} overflows the physical address space")]
    Overflow { base: u64, len: u64 },
}

/// A fault that cannot be serviced. The faulting access gets a bus error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusFault {
    #[error("fault requested at {requested:?} granularity, region only supports {supported:?}")]
    WrongGranularity {
        requested: EntrySize,
        supported: EntrySize,
    },
    #[error("page offset {pgoff:#x} is outside the {len:#x} byte window")]
    OutOfRange { pgoff: u64, len: u64 },
    #[error("huge page at {address:#x} does not fit in the mapping")]
    Misaligned { address: u64 },
}

/// A physical frame selected to back a fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysicalFrame {
    address: u64,
    size: EntrySize,
}

impl PhysicalFrame {
    /// The physical address of the start of the frame.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The frame size.
    pub fn size(&self) -> EntrySize {
        self.size
    }

    /// The base-page frame number of the start of the frame.
    pub fn pfn(&self) -> u64 {
        self.address >> PAGE_SHIFT
    }
}

/// A physically contiguous device-memory window, faulted in at a single
/// granularity.
///
/// The window is hardware-defined: there is nothing to allocate or free, so a
/// region is just a description that the driver and its sessions share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRegion {
    base: u64,
    len: u64,
    granularity: EntrySize,
}

impl MappedRegion {
    /// Describes the window `base..base + len`, resolved in `granularity`
    /// sized frames.
    pub fn new(base: u64, len: u64, granularity: EntrySize) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::Empty);
        }
        if base & !granularity.mask() != 0 {
            return Err(RegionError::MisalignedBase { base, granularity });
        }
        if len & !granularity.mask() != 0 {
            return Err(RegionError::MisalignedLength { len, granularity });
        }
        if base.checked_add(len).is_none() {
            return Err(RegionError::Overflow { base, len });
        }
        Ok(Self {
            base,
            len,
            granularity,
        })
    }

    /// The physical base address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The window length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// The only entry size faults are served at.
    pub fn granularity(&self) -> EntrySize {
        self.granularity
    }

    /// Returns true if `pgoff..pgoff + len` (page offset, byte length) lies
    /// inside the window.
    pub fn contains(&self, pgoff: u64, len: u64) -> bool {
        pgoff
            .checked_mul(1 << PAGE_SHIFT)
            .and_then(|start| start.checked_add(len))
            .is_some_and(|end| end <= self.len)
    }
}

/// Computes the frame that backs a fault at page offset `pgoff` into the
/// window.
///
/// The result is the start of the `region.granularity()` sized frame that
/// contains the offset. Any other `requested` size is refused.
pub fn resolve_fault(
    region: &MappedRegion,
    pgoff: u64,
    requested: EntrySize,
) -> Result<PhysicalFrame, BusFault> {
    if requested != region.granularity {
        return Err(BusFault::WrongGranularity {
            requested,
            supported: region.granularity,
        });
    }

    let offset = pgoff
        .checked_mul(1 << PAGE_SHIFT)
        .filter(|&offset| offset < region.len)
        .ok_or(BusFault::OutOfRange {
            pgoff,
            len: region.len,
        })?;

    Ok(PhysicalFrame {
        address: region.base + (offset & region.granularity.mask()),
        size: region.granularity,
    })
}

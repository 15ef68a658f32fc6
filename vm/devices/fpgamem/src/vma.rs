// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual mappings of the window and their fault handlers.

use crate::page_table::PudEntry;
use crate::page_table::PudTable;
use crate::region::resolve_fault;
use crate::region::BusFault;
use crate::region::MappedRegion;
use crate::region::PhysicalFrame;
use bitfield_struct::bitfield;
use fpgamem_defs::EntrySize;
use fpgamem_defs::PAGE_SHIFT;
use fpgamem_defs::PAGE_SIZE;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by [`Session::mmap`](crate::Session::mmap).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MmapError {
    #[error("mapping length must be non-zero")]
    Empty,
    #[error("device memory can only be mapped shared")]
    NotShared,
    #[error("mapping start {start:#x} is not page aligned")]
    Unaligned { start: u64 },
    #[error("mapping {start:#x}+{len:#x} wraps the address space")]
    Overflow { start: u64, len: u64 },
    #[error("page offset {pgoff:#x} with length {len:#x} exceeds the device window")]
    OutOfWindow { pgoff: u64, len: u64 },
}

/// Page protections requested for a mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    #[bits(5)]
    _reserved: u8,
}

impl Protection {
    /// Read-write access.
    pub fn read_write() -> Self {
        Self::new().with_read(true).with_write(true)
    }
}

/// Flags the driver attaches to a mapping.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct VmFlags {
    pub shared: bool,
    /// Backed by raw frames, with no `struct page` or page cache behind them.
    pub pfnmap: bool,
    /// Must not be expanded or merged with neighbouring mappings.
    pub io: bool,
    #[bits(5)]
    _reserved: u8,
}

/// An `mmap` request against an open session.
#[derive(Debug, Clone)]
pub struct MmapRequest {
    /// Virtual address the caller placed the mapping at.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
    /// Offset into the device, in base pages.
    pub pgoff: u64,
    pub prot: Protection,
    pub shared: bool,
}

impl MmapRequest {
    /// A shared read-write mapping of `len` bytes at `start`, starting at the
    /// beginning of the window.
    pub fn shared(start: u64, len: u64) -> Self {
        Self {
            start,
            len,
            pgoff: 0,
            prot: Protection::read_write(),
            shared: true,
        }
    }

    /// Sets the device page offset.
    pub fn with_pgoff(mut self, pgoff: u64) -> Self {
        self.pgoff = pgoff;
        self
    }
}

/// A single fault delivered to a mapping.
#[derive(Debug, Copy, Clone)]
pub struct VmFault {
    /// The faulting virtual address.
    pub address: u64,
    /// The entry size the fault is being resolved at.
    pub size: EntrySize,
}

/// A virtual mapping of the window. Nothing is populated when the mapping is
/// created; frames are installed one huge page at a time on first touch.
#[derive(Debug)]
pub struct VmArea {
    start: u64,
    end: u64,
    pgoff: u64,
    prot: Protection,
    flags: VmFlags,
    region: Arc<MappedRegion>,
}

impl VmArea {
    pub(crate) fn new(region: Arc<MappedRegion>, req: &MmapRequest) -> Result<Self, MmapError> {
        if req.len == 0 {
            return Err(MmapError::Empty);
        }
        if !req.shared {
            return Err(MmapError::NotShared);
        }
        if req.start % PAGE_SIZE != 0 {
            return Err(MmapError::Unaligned { start: req.start });
        }
        let end = req.start.checked_add(req.len).ok_or(MmapError::Overflow {
            start: req.start,
            len: req.len,
        })?;
        if !region.contains(req.pgoff, req.len) {
            return Err(MmapError::OutOfWindow {
                pgoff: req.pgoff,
                len: req.len,
            });
        }

        Ok(Self {
            start: req.start,
            end,
            pgoff: req.pgoff,
            prot: req.prot,
            flags: VmFlags::new()
                .with_shared(true)
                .with_pfnmap(true)
                .with_io(true),
            region,
        })
    }

    /// The first virtual address of the mapping.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last virtual address of the mapping.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn flags(&self) -> VmFlags {
        self.flags
    }

    pub fn prot(&self) -> Protection {
        self.prot
    }

    /// The device page offset of `address`, as seen by the fault handler.
    fn fault_pgoff(&self, address: u64) -> u64 {
        self.pgoff + ((address - self.start) >> PAGE_SHIFT)
    }

    /// Whether virtual addresses and device offsets agree on where each huge
    /// page of `size` begins. Without that, a block entry would translate the
    /// faulting address to the wrong device byte.
    fn huge_aligned(&self, size: EntrySize) -> bool {
        let delta = self.start.wrapping_sub(self.pgoff << PAGE_SHIFT);
        delta & !size.mask() == 0
    }

    /// Handles a fault at base-page granularity.
    ///
    /// The window is only ever served through huge entries, so this always
    /// fails.
    pub fn handle_fault(&self, fault: &VmFault) -> Result<PhysicalFrame, BusFault> {
        let err = BusFault::WrongGranularity {
            requested: EntrySize::Pte,
            supported: self.region.granularity(),
        };
        tracing::warn!(
            address = fault.address,
            error = &err as &dyn std::error::Error,
            "bus fault"
        );
        Err(err)
    }

    /// Handles a huge-page fault by installing a writable block entry for the
    /// huge page containing the faulting address.
    ///
    /// On success no further fault is needed for that huge page.
    pub fn handle_huge_fault<T: PudTable>(
        &self,
        fault: &VmFault,
        table: &T,
    ) -> Result<PhysicalFrame, BusFault> {
        self.huge_fault_inner(fault, table).inspect_err(|err| {
            tracing::warn!(
                address = fault.address,
                error = err as &dyn std::error::Error,
                "bus fault"
            );
        })
    }

    fn huge_fault_inner<T: PudTable>(
        &self,
        fault: &VmFault,
        table: &T,
    ) -> Result<PhysicalFrame, BusFault> {
        if !(self.start..self.end).contains(&fault.address) {
            return Err(BusFault::Misaligned {
                address: fault.address,
            });
        }

        let frame = resolve_fault(&self.region, self.fault_pgoff(fault.address), fault.size)?;
        if !self.huge_aligned(fault.size) {
            return Err(BusFault::Misaligned {
                address: fault.address,
            });
        }

        let virt = fault.address & fault.size.mask();
        if virt < self.start
            || virt
                .checked_add(fault.size.bytes())
                .is_none_or(|end| end > self.end)
        {
            return Err(BusFault::Misaligned { address: virt });
        }

        let entry = PudEntry::huge_writable(&frame);
        {
            let mut slot = table
                .lock(virt)
                .ok_or(BusFault::Misaligned { address: virt })?;
            *slot = entry;
        }

        tracing::trace!(virt, phys = frame.address(), "installed huge entry");
        Ok(frame)
    }

    /// Tears the mapping down, clearing every entry it may have installed.
    pub fn unmap<T: PudTable>(self, table: &T) {
        let size = self.region.granularity();
        let mut virt = self.start & size.mask();
        while virt < self.end {
            if let Some(mut slot) = table.lock(virt) {
                *slot = PudEntry::new();
            }
            let Some(next) = virt.checked_add(size.bytes()) else {
                break;
            };
            virt = next;
        }
        tracing::debug!(start = self.start, end = self.end, "unmapped");
    }
}

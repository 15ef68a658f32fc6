// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Upper-level (PUD) translation entries and the tables they are installed
//! into.

use crate::region::PhysicalFrame;
use bitfield_struct::bitfield;
use fpgamem_defs::EntrySize;
use fpgamem_defs::PAGE_SHIFT;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::ops::DerefMut;

/// A block translation entry at the PUD level.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PudEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    #[bits(4)]
    _mbz0: u8,
    /// Maps a block rather than pointing at a next-level table.
    pub huge: bool,
    #[bits(4)]
    _mbz1: u8,
    #[bits(40)]
    pub pfn: u64,
    #[bits(11)]
    _mbz2: u16,
    pub no_execute: bool,
}

impl PudEntry {
    /// Builds a present, writable, user-accessible huge entry mapping
    /// `frame`.
    pub fn huge_writable(frame: &PhysicalFrame) -> Self {
        debug_assert_eq!(frame.size(), EntrySize::Pud);
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_huge(true)
            .with_no_execute(true)
            .with_pfn(frame.pfn())
    }

    /// The physical address this entry maps.
    pub fn address(&self) -> u64 {
        self.pfn() << PAGE_SHIFT
    }
}

/// An address space's PUD-level entries.
///
/// Each entry is guarded by its own lock, which is held only for as long as
/// the entry is being read or written. Faults on different huge pages never
/// contend.
pub trait PudTable {
    /// Guard granting exclusive access to one entry.
    type Guard<'a>: DerefMut<Target = PudEntry>
    where
        Self: 'a;

    /// Locks the entry that translates `virt`, or returns `None` if the
    /// address is not covered by the table.
    fn lock(&self, virt: u64) -> Option<Self::Guard<'_>>;
}

/// A software PUD table covering one contiguous virtual range.
#[derive(Debug)]
pub struct SoftPudTable {
    base: u64,
    slots: Box<[Mutex<PudEntry>]>,
}

impl SoftPudTable {
    /// Creates an empty table covering `count` huge pages starting at the
    /// huge-page aligned virtual address `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not aligned to [`EntrySize::Pud`].
    pub fn new(base: u64, count: usize) -> Self {
        assert_eq!(
            base & !EntrySize::Pud.mask(),
            0,
            "table base must be huge-page aligned"
        );
        Self {
            base,
            slots: (0..count).map(|_| Mutex::new(PudEntry::new())).collect(),
        }
    }

    fn index(&self, virt: u64) -> Option<usize> {
        let index = virt.checked_sub(self.base)? >> EntrySize::Pud.shift();
        let index = usize::try_from(index).ok()?;
        (index < self.slots.len()).then_some(index)
    }

    /// Returns a copy of the entry for `virt`.
    pub fn entry(&self, virt: u64) -> Option<PudEntry> {
        self.index(virt).map(|i| *self.slots[i].lock())
    }

    /// The number of present entries.
    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|e| e.lock().present()).count()
    }
}

impl PudTable for SoftPudTable {
    type Guard<'a> = MutexGuard<'a, PudEntry>;

    fn lock(&self, virt: u64) -> Option<Self::Guard<'_>> {
        self.index(virt).map(|i| self.slots[i].lock())
    }
}

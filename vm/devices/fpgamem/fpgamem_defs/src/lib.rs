// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions shared between the FPGA memory driver and its user-mode
//! clients: the device name, the physical layout of the FPGA memory window,
//! and the cache-maintenance ioctl opcodes.

#![forbid(unsafe_code)]

use thiserror::Error;

/// The name of the character device, and of its node under `/dev`.
pub const DEVICE_NAME: &str = "fpgamem";

/// The path of the device node.
pub const DEVICE_PATH: &str = "/dev/fpgamem";

/// Physical address of the FPGA-resident memory window.
///
/// This is fixed by the Enzian address map. User-mode clients also map the
/// window at this virtual address, which is well above the ranges the kernel
/// hands out for heap and stack.
pub const FPGA_MEMORY_BASE: u64 = 0x100_0000_0000;

/// Size of the window exposed by the driver.
pub const FPGA_MEMORY_SIZE: u64 = 1 << 40;

/// Base page shift.
pub const PAGE_SHIFT: u32 = 12;
/// Base page size.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// The size of a page-table entry that a fault is resolved at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntrySize {
    /// A last-level 4 KiB page.
    Pte,
    /// A 2 MiB block.
    Pmd,
    /// A 1 GiB block.
    Pud,
}

impl EntrySize {
    /// The log2 of the number of bytes covered by one entry.
    pub const fn shift(self) -> u32 {
        match self {
            EntrySize::Pte => 12,
            EntrySize::Pmd => 21,
            EntrySize::Pud => 30,
        }
    }

    /// The number of bytes covered by one entry.
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// Mask that rounds an address down to the start of its entry.
    pub const fn mask(self) -> u64 {
        !(self.bytes() - 1)
    }
}

/// Error returned when decoding an unknown cache-maintenance opcode.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown cache maintenance opcode {0:#x}")]
pub struct OpcodeError(pub i64);

macro_rules! cache_ops {
    ($($(#[$attr:meta])* $name:ident = $value:literal, $text:literal;)*) => {
        /// A cache or TLB maintenance operation, as passed in the ioctl
        /// command word. Each operation takes one integer argument whose
        /// meaning (set/way index or address) depends on the operation.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CacheOp {
            $($(#[$attr])* $name = $value,)*
        }

        impl CacheOp {
            /// Every operation, in opcode order.
            pub const ALL: &'static [CacheOp] = &[$(CacheOp::$name,)*];

            /// The short name used on the command line.
            pub const fn name(self) -> &'static str {
                match self {
                    $(CacheOp::$name => $text,)*
                }
            }

            /// Looks up an operation by its short name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($text => Some(CacheOp::$name),)*
                    _ => None,
                }
            }
        }

        impl TryFrom<i64> for CacheOp {
            type Error = OpcodeError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(CacheOp::$name),)*
                    _ => Err(OpcodeError(value)),
                }
            }
        }
    };
}

cache_ops! {
    /// L2 index writeback and invalidate.
    IndexWritebackInvalidate = 0, "index-wbinv";
    /// L2 index writeback.
    IndexWriteback = 1, "index-wb";
    /// L2 index load tag.
    IndexLoadTag = 2, "index-load-tag";
    /// L2 index store tag.
    IndexStoreTag = 3, "index-store-tag";
    /// L2 hit invalidate.
    HitInvalidate = 4, "hit-inv";
    /// L2 hit writeback and invalidate.
    HitWritebackInvalidate = 5, "hit-wbinv";
    /// L2 hit writeback.
    HitWriteback = 6, "hit-wb";
    /// L2 fetch and lock.
    FetchAndLock = 7, "fetch-lock";
    /// Read a micro-TLB entry.
    ReadMicroTlb = 8, "read-utlb";
    /// Read a main TLB entry.
    ReadMainTlb = 9, "read-mtlb";
    /// Prefetch into the micro-TLB.
    PrefetchMicroTlb = 10, "prefetch-utlb";
}

impl TryFrom<u32> for CacheOp {
    type Error = OpcodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl std::fmt::Display for CacheOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

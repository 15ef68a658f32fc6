// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver for the FPGA-resident memory window on Enzian.
//!
//! The driver exposes a large physically contiguous window as a character
//! device. Mappings of the device are not populated up front: each huge page
//! is installed on first touch by [`VmArea::handle_huge_fault`], and any fault
//! at a smaller granularity is a bus error. The device ioctl gives user mode
//! access to the processor's cache and TLB maintenance instructions.
//!
//! All driver state lives in a [`MemoryDriver`] instance, created with
//! [`MemoryDriver::init`] and destroyed with [`MemoryDriver::teardown`].

// UNSAFETY: Issuing processor cache and TLB maintenance instructions.
#![expect(unsafe_code)]

mod cache;
mod chrdev;
pub mod page_table;
mod region;
mod vma;

pub use cache::dispatch;
pub use cache::CacheError;
pub use cache::CacheMaintenance;
pub use cache::IoctlError;
pub use cache::NativeCache;
pub use chrdev::ChrdevError;
pub use chrdev::ChrdevRegistry;
pub use chrdev::DeviceNumber;
pub use region::resolve_fault;
pub use region::BusFault;
pub use region::MappedRegion;
pub use region::PhysicalFrame;
pub use region::RegionError;
pub use vma::MmapError;
pub use vma::MmapRequest;
pub use vma::Protection;
pub use vma::VmArea;
pub use vma::VmFault;
pub use vma::VmFlags;

use fpgamem_defs::EntrySize;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Device name, used for the device number registration and the node.
    pub name: String,
    /// Physical base of the window.
    pub base: u64,
    /// Length of the window in bytes.
    pub len: u64,
    /// The entry size faults are served at.
    pub granularity: EntrySize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: fpgamem_defs::DEVICE_NAME.into(),
            base: fpgamem_defs::FPGA_MEMORY_BASE,
            len: fpgamem_defs::FPGA_MEMORY_SIZE,
            granularity: EntrySize::Pud,
        }
    }
}

/// Error initializing the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid device memory window")]
    Region(#[source] RegionError),
    #[error("failed to register device {name}")]
    Register {
        name: String,
        #[source]
        source: ChrdevError,
    },
}

/// Error returned when tearing down a driver that still has open sessions.
///
/// The driver stays registered and can be recovered with
/// [`DriverBusy::into_driver`].
#[derive(Error)]
#[error("driver busy with {sessions} open sessions")]
pub struct DriverBusy<C> {
    sessions: usize,
    driver: MemoryDriver<C>,
}

impl<C> fmt::Debug for DriverBusy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverBusy")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl<C> DriverBusy<C> {
    /// Returns the driver that could not be torn down.
    pub fn into_driver(self) -> MemoryDriver<C> {
        self.driver
    }
}

/// The inode backing the device node.
#[derive(Debug, Default)]
pub struct DeviceInode {
    dax: AtomicBool,
}

impl DeviceInode {
    /// Whether accesses bypass the page cache and go straight to the
    /// physical frames.
    pub fn is_dax(&self) -> bool {
        self.dax.load(Ordering::Acquire)
    }
}

struct DriverShared<C> {
    region: Arc<MappedRegion>,
    cache: C,
    inode: DeviceInode,
    sessions: AtomicUsize,
}

/// A registered instance of the driver.
pub struct MemoryDriver<C = NativeCache> {
    name: String,
    devt: DeviceNumber,
    registry: ChrdevRegistry,
    shared: Arc<DriverShared<C>>,
}

impl MemoryDriver<NativeCache> {
    /// Registers the device described by `config`, issuing cache
    /// maintenance with this processor's instructions.
    pub fn init(config: DriverConfig, registry: &ChrdevRegistry) -> Result<Self, DriverError> {
        Self::with_cache(config, registry, NativeCache::default())
    }
}

impl<C: CacheMaintenance> MemoryDriver<C> {
    /// Registers the device described by `config`, issuing cache
    /// maintenance through `cache`.
    pub fn with_cache(
        config: DriverConfig,
        registry: &ChrdevRegistry,
        cache: C,
    ) -> Result<Self, DriverError> {
        let region = MappedRegion::new(config.base, config.len, config.granularity)
            .map_err(DriverError::Region)?;
        let devt = registry
            .alloc(&config.name)
            .map_err(|source| DriverError::Register {
                name: config.name.clone(),
                source,
            })?;

        tracing::info!(
            name = %config.name,
            major = devt.major,
            base = region.base(),
            len = region.len(),
            "registered fpga memory device"
        );

        Ok(Self {
            name: config.name,
            devt,
            registry: registry.clone(),
            shared: Arc::new(DriverShared {
                region: Arc::new(region),
                cache,
                inode: DeviceInode::default(),
                sessions: AtomicUsize::new(0),
            }),
        })
    }

    /// Opens a new session on the device.
    pub fn open(&self) -> Session<C> {
        self.shared.inode.dax.store(true, Ordering::Release);
        let sessions = self.shared.sessions.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(name = %self.name, sessions, "session opened");
        Session {
            shared: self.shared.clone(),
        }
    }

    /// Unregisters the device.
    ///
    /// Fails if any session is still open.
    pub fn teardown(self) -> Result<(), DriverBusy<C>> {
        let sessions = self.shared.sessions.load(Ordering::Acquire);
        if sessions != 0 {
            return Err(DriverBusy {
                sessions,
                driver: self,
            });
        }
        self.registry.release(self.devt);
        tracing::info!(name = %self.name, "unregistered fpga memory device");
        Ok(())
    }
}

impl<C> MemoryDriver<C> {
    /// The device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device number the node is created with.
    pub fn device_number(&self) -> DeviceNumber {
        self.devt
    }

    /// The window exposed by the device.
    pub fn region(&self) -> &MappedRegion {
        &self.shared.region
    }

    /// The device inode.
    pub fn inode(&self) -> &DeviceInode {
        &self.shared.inode
    }

    /// The number of open sessions.
    pub fn open_sessions(&self) -> usize {
        self.shared.sessions.load(Ordering::Acquire)
    }
}

/// An open file on the device.
///
/// Releasing the session (explicitly or by dropping it) does not affect
/// mappings created through it.
pub struct Session<C = NativeCache> {
    shared: Arc<DriverShared<C>>,
}

impl<C: CacheMaintenance> Session<C> {
    /// Creates a mapping of the window. No frames are installed until the
    /// mapping is touched.
    pub fn mmap(&self, req: &MmapRequest) -> Result<VmArea, MmapError> {
        let vma = VmArea::new(self.shared.region.clone(), req)?;
        tracing::debug!(
            start = req.start,
            len = req.len,
            pgoff = req.pgoff,
            "mapped device memory"
        );
        Ok(vma)
    }

    /// Handles the device ioctl: issues the cache maintenance operation
    /// encoded in `cmd` with operand `arg`.
    ///
    /// # Safety
    ///
    /// See [`CacheMaintenance::apply`].
    pub unsafe fn ioctl(&self, cmd: u32, arg: u64) -> Result<(), IoctlError> {
        // SAFETY: guaranteed by caller.
        unsafe { dispatch(&self.shared.cache, cmd, arg) }
    }

    /// Closes the session.
    pub fn release(self) {}
}

impl<C> Drop for Session<C> {
    fn drop(&mut self) {
        let sessions = self.shared.sessions.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::debug!(sessions, "session released");
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Character device number allocation.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;

/// Dynamically assigned majors, searched from the top of each range down.
const DYNAMIC_MAJORS: [RangeInclusive<u32>; 2] = [234..=254, 384..=511];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChrdevError {
    #[error("device name is already registered")]
    NameInUse,
    #[error("no free dynamic major numbers")]
    Exhausted,
}

/// A major/minor device number pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// The set of registered character devices.
///
/// Cloning gives another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct ChrdevRegistry {
    majors: Arc<Mutex<BTreeMap<u32, String>>>,
}

impl ChrdevRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a dynamic major for `name`, with minor 0.
    pub fn alloc(&self, name: &str) -> Result<DeviceNumber, ChrdevError> {
        let mut majors = self.majors.lock();
        if majors.values().any(|n| n == name) {
            return Err(ChrdevError::NameInUse);
        }
        let major = DYNAMIC_MAJORS
            .iter()
            .flat_map(|range| range.clone().rev())
            .find(|major| !majors.contains_key(major))
            .ok_or(ChrdevError::Exhausted)?;
        majors.insert(major, name.to_owned());
        Ok(DeviceNumber { major, minor: 0 })
    }

    /// Releases a number returned by [`alloc`](Self::alloc).
    pub fn release(&self, devt: DeviceNumber) {
        self.majors.lock().remove(&devt.major);
    }

    /// The name registered under `major`, if any.
    pub fn lookup(&self, major: u32) -> Option<String> {
        self.majors.lock().get(&major).cloned()
    }
}

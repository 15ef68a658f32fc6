// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Direct access to the FPGA's PCIe BAR 0 through sysfs.
//!
//! The FPGA decodes 16-byte transactions, so the window is only accessed in
//! pairs of words.

use crate::map_shared;
use crate::Error as MapError;
use crate::FpgaMapping;
use fs_err::os::unix::fs::OpenOptionsExt;
use std::os::unix::prelude::*;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// The size of the BAR window that is mapped by default.
pub const BAR_WINDOW_SIZE: usize = 0x10000;

#[derive(Debug, Error)]
pub enum BarError {
    #[error("failed to open {path}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to map bar")]
    Map(#[source] MapError),
    #[error("word count {0} is not a whole number of 16-byte transactions")]
    OddWordCount(usize),
    #[error("access of {len:#x} bytes at {offset:#x} is outside the bar window")]
    OutOfBounds { offset: usize, len: usize },
}

/// A mapping of a PCIe device's BAR 0.
pub struct BarWindow {
    mapping: FpgaMapping,
    _file: fs_err::File,
}

impl BarWindow {
    /// Maps BAR 0 of the PCI device `pci_id`, for example `0004:90:00.0`.
    pub fn open(pci_id: &str) -> Result<Self, BarError> {
        let path = format!("/sys/bus/pci/devices/{pci_id}/resource0");
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&path)
            .map_err(|source| BarError::Open { path, source })?;
        Self::from_file(file, BAR_WINDOW_SIZE)
    }

    /// Maps the first `len` bytes of an already open resource file.
    pub fn from_file(file: fs_err::File, len: usize) -> Result<Self, BarError> {
        let mapping = map_shared(file.file().as_fd(), None, len, 0).map_err(BarError::Map)?;
        Ok(Self {
            mapping,
            _file: file,
        })
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), BarError> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(BarError::OutOfBounds { offset, len });
        }
        Ok(())
    }

    /// Writes `words` to the start of the window, two words per store.
    pub fn write_words(&self, words: &[u64]) -> Result<(), BarError> {
        if words.len() % 2 != 0 {
            return Err(BarError::OddWordCount(words.len()));
        }
        self.check(0, size_of_val(words))?;
        let base = self.mapping.as_ptr().cast::<u128>();
        for (i, pair) in words.chunks_exact(2).enumerate() {
            let value = u128::from(pair[0]) | (u128::from(pair[1]) << 64);
            // SAFETY: the store is inside the mapping, which is page aligned
            // and so aligned for u128.
            unsafe { std::ptr::write_volatile(base.add(i), value) };
        }
        tracing::trace!(words = words.len(), "bar write");
        Ok(())
    }

    /// Reads the two words starting at word `2 * index` in one load.
    pub fn read_pair(&self, index: usize) -> Result<[u64; 2], BarError> {
        let offset = index
            .checked_mul(size_of::<u128>())
            .ok_or(BarError::OutOfBounds {
                offset: usize::MAX,
                len: size_of::<u128>(),
            })?;
        self.check(offset, size_of::<u128>())?;
        // SAFETY: the load is inside the mapping and aligned.
        let value =
            unsafe { std::ptr::read_volatile(self.mapping.as_ptr().cast::<u128>().add(index)) };
        fence(Ordering::SeqCst);
        Ok([value as u64, (value >> 64) as u64])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn window(len: usize) -> (tempfile::NamedTempFile, BarWindow) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(len as u64).unwrap();
        let opened = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(file.path())
            .unwrap();
        let bar = BarWindow::from_file(opened, len).unwrap();
        (file, bar)
    }

    #[test]
    fn words_are_stored_in_order() {
        let (mut file, bar) = window(BAR_WINDOW_SIZE);
        bar.write_words(&[1, 2, 3, 4]).unwrap();
        assert_eq!(bar.read_pair(0).unwrap(), [1, 2]);
        assert_eq!(bar.read_pair(1).unwrap(), [3, 4]);
        assert_eq!(bar.read_pair(2).unwrap(), [0, 0]);

        let mut contents = vec![0; 32];
        file.read_exact(&mut contents).unwrap();
        let words: Vec<u64> = contents
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
            .collect();
        assert_eq!(words, [1, 2, 3, 4]);
    }

    #[test]
    fn odd_word_counts_are_rejected() {
        let (_file, bar) = window(BAR_WINDOW_SIZE);
        assert!(matches!(
            bar.write_words(&[1, 2, 3]),
            Err(BarError::OddWordCount(3))
        ));
        assert_eq!(bar.read_pair(0).unwrap(), [0, 0]);
    }

    #[test]
    fn accesses_stay_in_the_window() {
        let (_file, bar) = window(4096);
        assert!(bar.read_pair(4096 / 16 - 1).is_ok());
        assert!(matches!(
            bar.read_pair(4096 / 16),
            Err(BarError::OutOfBounds { .. })
        ));
        assert!(matches!(
            bar.read_pair(usize::MAX),
            Err(BarError::OutOfBounds { .. })
        ));
        assert!(matches!(
            bar.write_words(&[0; 514]),
            Err(BarError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn missing_device() {
        assert!(matches!(
            BarWindow::open("ffff:ff:ff.7"),
            Err(BarError::Open { .. })
        ));
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The resources a hardware context is built from.

use crate::buffer::PageBuffer;
use std::io::Read;
use std::io::Write;
use std::ops::DerefMut;
use std::path::Path;
use std::path::PathBuf;

/// The default host-to-card channel.
pub const DEFAULT_H2C_PATH: &str = "/dev/xdma0_h2c_0";
/// The default card-to-host channel.
pub const DEFAULT_C2H_PATH: &str = "/dev/xdma0_c2h_0";

/// Provides transfer buffers and the two stream channels.
pub trait XdmaBackend {
    /// A fixed-size transfer buffer.
    type Buffer: DerefMut<Target = [u8]>;
    /// The host-to-card channel.
    type H2c: Write;
    /// The card-to-host channel.
    type C2h: Read;

    /// Allocates a zeroed buffer of exactly `len` bytes.
    fn alloc_buffer(&mut self, len: usize) -> std::io::Result<Self::Buffer>;

    fn open_h2c(&mut self) -> std::io::Result<Self::H2c>;

    fn open_c2h(&mut self) -> std::io::Result<Self::C2h>;
}

/// An XDMA device exposed through its Linux character devices.
#[derive(Debug, Clone)]
pub struct XdmaDevice {
    h2c_path: PathBuf,
    c2h_path: PathBuf,
}

impl Default for XdmaDevice {
    fn default() -> Self {
        Self {
            h2c_path: DEFAULT_H2C_PATH.into(),
            c2h_path: DEFAULT_C2H_PATH.into(),
        }
    }
}

impl XdmaDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host-to-card device path.
    pub fn with_h2c_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.h2c_path = path.into();
        self
    }

    /// Sets the card-to-host device path.
    pub fn with_c2h_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.c2h_path = path.into();
        self
    }

    pub fn h2c_path(&self) -> &Path {
        &self.h2c_path
    }

    pub fn c2h_path(&self) -> &Path {
        &self.c2h_path
    }

    fn open_channel(path: &Path) -> std::io::Result<fs_err::File> {
        fs_err::OpenOptions::new().read(true).write(true).open(path)
    }
}

impl XdmaBackend for XdmaDevice {
    type Buffer = PageBuffer;
    type H2c = fs_err::File;
    type C2h = fs_err::File;

    fn alloc_buffer(&mut self, len: usize) -> std::io::Result<PageBuffer> {
        PageBuffer::new(len)
    }

    fn open_h2c(&mut self) -> std::io::Result<fs_err::File> {
        Self::open_channel(&self.h2c_path)
    }

    fn open_c2h(&mut self) -> std::io::Result<fs_err::File> {
        Self::open_channel(&self.c2h_path)
    }
}

#![forbid(unsafe_code)]
//! Runtime options for the allocator and the node layers above it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{file::CURRENT_FORMAT_VERSION, Result, StrataError};

/// Default B+-tree fan-out and leaf capacity.
pub const DEFAULT_MAX_BPNODE_SIZE: usize = 1000;
/// Default largest payload of a single blob chunk.
pub const DEFAULT_MAX_BLOB_CHUNK_SIZE: usize = 0x00FF_FFF8 - 8;

/// Options consumed by [`crate::primitives::slab::SlabAlloc`] and the node layers.
///
/// All fields have defaults, so a TOML file only needs the keys it overrides:
///
/// ```toml
/// memory_limit = 1048576
/// track_allocations = true
/// max_bpnode_size = 256
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Upper bound on bytes held in slabs; `None` means unbounded.
    pub memory_limit: Option<usize>,
    /// Keep a shadow table of live allocations to reject double frees.
    pub track_allocations: bool,
    /// Maximum elements per leaf and children per inner node.
    pub max_bpnode_size: usize,
    /// Maximum payload bytes per blob chunk.
    pub max_blob_chunk_size: usize,
    /// Format version written into the header of a new store.
    pub file_format_version: u8,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            memory_limit: None,
            track_allocations: cfg!(debug_assertions),
            max_bpnode_size: DEFAULT_MAX_BPNODE_SIZE,
            max_blob_chunk_size: DEFAULT_MAX_BLOB_CHUNK_SIZE,
            file_format_version: CURRENT_FORMAT_VERSION,
        }
    }
}

impl StorageOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the bytes the allocator may hold in slabs.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Enables or disables the shadow allocation table.
    pub fn track_allocations(mut self, enabled: bool) -> Self {
        self.track_allocations = enabled;
        self
    }

    /// Sets the B+-tree node size.
    pub fn max_bpnode_size(mut self, size: usize) -> Self {
        self.max_bpnode_size = size;
        self
    }

    /// Sets the blob chunk size.
    pub fn max_blob_chunk_size(mut self, bytes: usize) -> Self {
        self.max_blob_chunk_size = bytes;
        self
    }

    /// Sets the format version used for new stores.
    pub fn file_format_version(mut self, version: u8) -> Self {
        self.file_format_version = version;
        self
    }

    /// Checks that the options describe a usable configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_bpnode_size < 2 {
            return Err(StrataError::Config(format!(
                "max_bpnode_size must be at least 2, got {}",
                self.max_bpnode_size
            )));
        }
        if self.max_blob_chunk_size == 0 || self.max_blob_chunk_size > DEFAULT_MAX_BLOB_CHUNK_SIZE
        {
            return Err(StrataError::Config(format!(
                "max_blob_chunk_size must be in 1..={DEFAULT_MAX_BLOB_CHUNK_SIZE}, got {}",
                self.max_blob_chunk_size
            )));
        }
        if !(1..=CURRENT_FORMAT_VERSION).contains(&self.file_format_version) {
            return Err(StrataError::Config(format!(
                "unsupported file_format_version {}",
                self.file_format_version
            )));
        }
        Ok(())
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(text).map_err(|err| StrataError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serializes the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| StrataError::Config(err.to_string()))
    }
}

use serde::{Deserialize, Serialize};

use crate::handle_cache::DEFAULT_CAPACITY;

/// Options of an [crate::N5Hdf5Store].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreOptions {
    /// Report [Self::default_block_size] instead of the native chunk shape.
    pub override_block_size: bool,
    /// Block size (N5 axis order) of contiguous datasets, or of all datasets when overriding.
    ///
    /// Axes beyond its length, or with a size of 0, use the full dataset extent.
    pub default_block_size: Vec<u32>,
    /// Number of datasets whose handles are kept open.
    pub max_open_datasets: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            override_block_size: false,
            default_block_size: Vec::new(),
            max_open_datasets: DEFAULT_CAPACITY,
        }
    }
}

impl StoreOptions {
    pub fn with_override_block_size(mut self, override_block_size: bool) -> Self {
        self.override_block_size = override_block_size;
        self
    }

    pub fn with_default_block_size(mut self, default_block_size: Vec<u32>) -> Self {
        self.default_block_size = default_block_size;
        self
    }

    pub fn with_max_open_datasets(mut self, max_open_datasets: usize) -> Self {
        self.max_open_datasets = max_open_datasets;
        self
    }

    /// Block size for a dataset of the given dimensions (N5 axis order).
    ///
    /// `native_block_size` is used unless overriding or absent.
    pub fn block_size(&self, dimensions: &[u64], native_block_size: Option<Vec<u32>>) -> Vec<u32> {
        if let (false, Some(block_size)) = (self.override_block_size, native_block_size) {
            return block_size;
        }
        dimensions
            .iter()
            .enumerate()
            .map(|(i, &d)| match self.default_block_size.get(i) {
                Some(&b) if b > 0 => b,
                _ => u32::try_from(d).unwrap_or(u32::MAX).max(1),
            })
            .collect()
    }
}

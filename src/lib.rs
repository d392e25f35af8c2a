//! The N5 API on top of an HDF5-style chunked container.
//!
//! N5 datasets map onto chunked native datasets with reversed axis order, N5 blocks onto
//! hyperslab selections, and N5 attributes onto native typed attributes plus a JSON
//! document for structured values. See [N5Hdf5Store].

pub mod api;
pub mod attribute_path;
pub mod attributes;
pub mod axis;
pub mod block;
pub mod config;
pub mod container;
mod error;
pub mod handle_cache;
pub mod metadata;
pub mod native;
pub mod storage;

pub use api::{N5Reader, N5Writer};
pub use attributes::{AttributeKind, AttributeValue, N5_JSON_ROOT_KEY};
pub use block::{DataBlock, DataBuffer};
pub use config::StoreOptions;
pub use container::{Container, FileContainer};
pub use error::{Error, Result};
pub use metadata::{DataType, DatasetAttributes, N5Compression};
pub use storage::N5Hdf5Store;

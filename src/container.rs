//! The container engine as seen by the N5 layer.
//!
//! A container stores groups and typed n-dimensional datasets in C axis order,
//! addressed by absolute paths (`/`, `/a/b`), with native typed attributes on every node.
//! Datasets are read and written through opaque handles and hyperslab selections.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::DataBuffer;

pub mod file;
pub mod filter;

pub use file::FileContainer;

/// Opaque identifier of an open native object (dataset or property list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeId(pub(crate) u64);

impl fmt::Display for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Native element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    /// Variable-length UTF-8 string.
    VarString,
}

impl NativeType {
    /// Size of one element in bytes, `None` for variable-length types.
    pub fn size(&self) -> Option<usize> {
        match self {
            NativeType::Bool | NativeType::Int8 | NativeType::Uint8 => Some(1),
            NativeType::Int16 | NativeType::Uint16 => Some(2),
            NativeType::Int32 | NativeType::Uint32 | NativeType::Float32 => Some(4),
            NativeType::Int64 | NativeType::Uint64 | NativeType::Float64 => Some(8),
            NativeType::VarString => None,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            NativeType::Int8
                | NativeType::Int16
                | NativeType::Int32
                | NativeType::Int64
                | NativeType::Float32
                | NativeType::Float64
        )
    }
}

/// Chunk-level storage transforms of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum StorageFeatures {
    /// Numeric data, stored as is.
    NoCompression,
    /// Numeric data, byte-shuffled then deflated.
    ShuffleDeflate { level: u32 },
    /// Non-numeric data, stored as is.
    GenericNoCompression,
    /// Non-numeric data, deflated.
    GenericDeflate { level: u32 },
}

impl StorageFeatures {
    /// Whether these features may be applied to elements of the given type.
    pub fn applies_to(&self, native_type: NativeType) -> bool {
        let numeric = native_type.size().is_some();
        match self {
            StorageFeatures::NoCompression | StorageFeatures::ShuffleDeflate { .. } => numeric,
            StorageFeatures::GenericNoCompression | StorageFeatures::GenericDeflate { .. } => {
                !numeric
            }
        }
    }
}

/// A native scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeScalar {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl NativeScalar {
    pub fn native_type(&self) -> NativeType {
        match self {
            NativeScalar::Bool(_) => NativeType::Bool,
            NativeScalar::Int8(_) => NativeType::Int8,
            NativeScalar::Int16(_) => NativeType::Int16,
            NativeScalar::Int32(_) => NativeType::Int32,
            NativeScalar::Int64(_) => NativeType::Int64,
            NativeScalar::Uint8(_) => NativeType::Uint8,
            NativeScalar::Uint16(_) => NativeType::Uint16,
            NativeScalar::Uint32(_) => NativeType::Uint32,
            NativeScalar::Uint64(_) => NativeType::Uint64,
            NativeScalar::Float32(_) => NativeType::Float32,
            NativeScalar::Float64(_) => NativeType::Float64,
            NativeScalar::String(_) => NativeType::VarString,
        }
    }
}

/// A native attribute: a scalar, a 1-D array or a 2-D matrix of one element type.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeAttribute {
    Scalar { value: NativeScalar },
    Array { values: DataBuffer },
    /// Row-major values.
    Matrix {
        rows: usize,
        cols: usize,
        values: DataBuffer,
    },
}

impl NativeAttribute {
    pub fn native_type(&self) -> NativeType {
        match self {
            NativeAttribute::Scalar { value } => value.native_type(),
            NativeAttribute::Array { values } | NativeAttribute::Matrix { values, .. } => {
                values.native_type()
            }
        }
    }
}

/// Shape information of a native dataset, in container axis order.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetInfo {
    pub dimensions: Vec<u64>,
    /// `None` for contiguous (unchunked) datasets.
    pub chunk_shape: Option<Vec<u64>>,
    pub native_type: NativeType,
}

/// A rectangular selection of a dataset, in container axis order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hyperslab {
    pub offset: Vec<u64>,
    pub extent: Vec<u64>,
}

impl Hyperslab {
    pub fn new(offset: Vec<u64>, extent: Vec<u64>) -> crate::Result<Self> {
        if offset.len() != extent.len() {
            return Err(crate::Error::DimensionMismatch {
                expected: offset.len(),
                actual: extent.len(),
            });
        }
        Ok(Self { offset, extent })
    }

    pub fn num_elements(&self) -> usize {
        self.extent.iter().map(|&e| e as usize).product()
    }

    /// Whether the selection lies entirely within a dataset of the given shape.
    pub fn fits(&self, dimensions: &[u64]) -> bool {
        self.offset.len() == dimensions.len()
            && self
                .offset
                .iter()
                .zip(&self.extent)
                .zip(dimensions)
                .all(|((&o, &e), &d)| o.checked_add(e).is_some_and(|end| end <= d))
    }
}

/// Capability set of a container engine.
///
/// Paths are absolute and normalized. All methods are synchronous and may block on I/O.
/// Implementations must tolerate concurrent calls on distinct datasets.
pub trait Container: Send + Sync {
    /// Whether a group or dataset exists at `path`.
    fn exists(&self, path: &str) -> crate::Result<bool>;

    fn is_dataset(&self, path: &str) -> crate::Result<bool>;

    fn is_group(&self, path: &str) -> crate::Result<bool>;

    /// Names of the direct children of a group.
    fn group_members(&self, path: &str) -> crate::Result<Vec<String>>;

    /// Create a group, including missing intermediate groups.
    fn create_group(&self, path: &str) -> crate::Result<()>;

    /// Delete a group or dataset and everything below it.
    fn delete(&self, path: &str) -> crate::Result<()>;

    /// Create a dataset, including missing intermediate groups.
    fn create_array(
        &self,
        path: &str,
        dimensions: &[u64],
        chunk_shape: Option<&[u64]>,
        native_type: NativeType,
        features: StorageFeatures,
    ) -> crate::Result<()>;

    fn dataset_info(&self, path: &str) -> crate::Result<DatasetInfo>;

    fn open_dataset(&self, path: &str) -> crate::Result<NativeId>;

    fn close_dataset(&self, id: NativeId) -> crate::Result<()>;

    /// Create a transfer property list to be used for hyperslab I/O.
    fn create_transfer_properties(&self) -> crate::Result<NativeId>;

    fn close_transfer_properties(&self, id: NativeId) -> crate::Result<()>;

    /// Read a selection into `buffer`, whose type and length must match the dataset and selection.
    fn read_hyperslab(
        &self,
        dataset: NativeId,
        transfer: NativeId,
        selection: &Hyperslab,
        buffer: &mut DataBuffer,
    ) -> crate::Result<()>;

    /// Write `buffer` to a selection; type and length must match the dataset and selection.
    fn write_hyperslab(
        &self,
        dataset: NativeId,
        transfer: NativeId,
        selection: &Hyperslab,
        buffer: &DataBuffer,
    ) -> crate::Result<()>;

    fn attribute_names(&self, path: &str) -> crate::Result<Vec<String>>;

    fn has_attribute(&self, path: &str, key: &str) -> crate::Result<bool>;

    fn get_attribute(&self, path: &str, key: &str) -> crate::Result<Option<NativeAttribute>>;

    fn set_attribute(&self, path: &str, key: &str, value: &NativeAttribute) -> crate::Result<()>;

    /// Returns whether an attribute was deleted.
    fn delete_attribute(&self, path: &str, key: &str) -> crate::Result<bool>;

    /// The backing file, if any.
    fn file_path(&self) -> Option<&Path>;

    /// Persist all changes.
    fn flush(&self) -> crate::Result<()>;

    /// Persist and release the container. Idempotent.
    fn close(&self) -> crate::Result<()>;
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Attribute key of the N5 version on the root group.
pub const VERSION_KEY: &str = "n5";

/// SemVer version of the N5-HDF5 layout written by this crate.
pub const VERSION: semver::Version = semver::Version::new(2, 2, 0);

/// Whether a stored version can be read by this crate.
///
/// Only the major version has to match.
pub fn is_compatible(version: &semver::Version) -> bool {
    version.major == VERSION.major
}

/// N5 element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Object,
}

impl DataType {
    pub const ALL: [DataType; 12] = [
        DataType::Uint8,
        DataType::Uint16,
        DataType::Uint32,
        DataType::Uint64,
        DataType::Int8,
        DataType::Int16,
        DataType::Int32,
        DataType::Int64,
        DataType::Float32,
        DataType::Float64,
        DataType::String,
        DataType::Object,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Uint8 => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Object => "object",
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, DataType::String)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str() == s)
            .ok_or_else(|| crate::Error::UnsupportedDataType(s.to_string()))
    }
}

/// N5 chunk compression configuration.
///
/// Only [N5Compression::Raw] and [N5Compression::Gzip] can be expressed by the container;
/// the others are rejected when a dataset is created.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Copy)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum N5Compression {
    /// Uncompressed.
    #[default]
    Raw,
    Bzip2 {
        /// Default 9. Must be in the range 1..=9.
        #[serde(default = "default_bzip2_block_size")]
        block_size: u8,
    },
    Gzip {
        /// Default -1, meaning "implementation default" (usually 6).
        /// The container always deflates at its own fixed level.
        #[serde(default = "default_gzip_level")]
        level: i8,
    },
    Lz4 {
        /// Default 65536. Must be a positive integer.
        #[serde(default = "lz4_default_level")]
        level: u64,
    },
    Xz {
        /// Default 6.
        #[serde(default = "default_xz_preset")]
        preset: u32,
    },
}

fn default_bzip2_block_size() -> u8 {
    9
}

fn default_gzip_level() -> i8 {
    -1
}

fn lz4_default_level() -> u64 {
    65536
}

fn default_xz_preset() -> u32 {
    6
}

impl N5Compression {
    pub fn gzip() -> Self {
        N5Compression::Gzip {
            level: default_gzip_level(),
        }
    }
}

/// Representation of N5 dataset attributes.
///
/// All vectors are in N5 axis order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAttributes {
    /// Dataset shape.
    pub dimensions: Vec<u64>,
    /// Nominal block shape; may exceed `dimensions` in any axis.
    pub block_size: Vec<u32>,
    pub data_type: DataType,
    pub compression: N5Compression,
}

impl DatasetAttributes {
    pub fn new(
        dimensions: Vec<u64>,
        block_size: Vec<u32>,
        data_type: DataType,
        compression: N5Compression,
    ) -> crate::Result<Self> {
        if dimensions.len() != block_size.len() {
            return Err(crate::Error::DimensionMismatch {
                expected: dimensions.len(),
                actual: block_size.len(),
            });
        }
        if block_size.contains(&0) {
            return Err(crate::Error::general(format!(
                "block size must be positive, got {block_size:?}"
            )));
        }
        Ok(Self {
            dimensions,
            block_size,
            data_type,
            compression,
        })
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    /// Number of elements in a full, uncropped block.
    pub fn block_num_elements(&self) -> usize {
        self.block_size.iter().map(|&b| b as usize).product()
    }
}

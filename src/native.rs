//! Mapping of N5 element types and compression onto native container types and storage features.

use crate::container::{NativeType, StorageFeatures};
use crate::metadata::{DataType, N5Compression};

/// Deflate level of the container's single supported compression scheme.
pub const DEFLATE_LEVEL: u32 = 6;

/// Native type tag for an N5 element type.
pub fn native_type(data_type: DataType) -> crate::Result<NativeType> {
    let out = match data_type {
        DataType::Uint8 => NativeType::Uint8,
        DataType::Uint16 => NativeType::Uint16,
        DataType::Uint32 => NativeType::Uint32,
        DataType::Uint64 => NativeType::Uint64,
        DataType::Int8 => NativeType::Int8,
        DataType::Int16 => NativeType::Int16,
        DataType::Int32 => NativeType::Int32,
        DataType::Int64 => NativeType::Int64,
        DataType::Float32 => NativeType::Float32,
        DataType::Float64 => NativeType::Float64,
        DataType::String => NativeType::VarString,
        DataType::Object => {
            return Err(crate::Error::UnsupportedDataType(format!(
                "{data_type} has no native counterpart"
            )));
        }
    };
    Ok(out)
}

/// N5 element type of a native dataset type.
pub fn data_type(native_type: NativeType) -> crate::Result<DataType> {
    let out = match native_type {
        NativeType::Uint8 => DataType::Uint8,
        NativeType::Uint16 => DataType::Uint16,
        NativeType::Uint32 => DataType::Uint32,
        NativeType::Uint64 => DataType::Uint64,
        NativeType::Int8 => DataType::Int8,
        NativeType::Int16 => DataType::Int16,
        NativeType::Int32 => DataType::Int32,
        NativeType::Int64 => DataType::Int64,
        NativeType::Float32 => DataType::Float32,
        NativeType::Float64 => DataType::Float64,
        NativeType::VarString => DataType::String,
        NativeType::Bool => {
            return Err(crate::Error::UnsupportedDataType(format!(
                "datasets of native type {native_type:?} are not supported"
            )));
        }
    };
    Ok(out)
}

/// Storage features for a compression choice and element type.
pub fn storage_features(
    compression: &N5Compression,
    data_type: DataType,
) -> crate::Result<StorageFeatures> {
    let deflate = match compression {
        N5Compression::Raw => false,
        N5Compression::Gzip { .. } => true,
        c => {
            return Err(crate::Error::UnsupportedCompression(format!(
                "{c:?} cannot be stored in the container"
            )));
        }
    };
    let out = match (data_type.is_string(), deflate) {
        (false, false) => StorageFeatures::NoCompression,
        (false, true) => StorageFeatures::ShuffleDeflate {
            level: DEFLATE_LEVEL,
        },
        (true, false) => StorageFeatures::GenericNoCompression,
        (true, true) => StorageFeatures::GenericDeflate {
            level: DEFLATE_LEVEL,
        },
    };
    Ok(out)
}

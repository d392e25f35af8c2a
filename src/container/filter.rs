//! Payload encoding for [super::FileContainer]: chunks go through element serialization
//! followed by the dataset's storage features; attributes are stored as raw elements.
//!
//! Numeric elements are little-endian, so every float (NaN and infinities included)
//! round-trips bit for bit. Strings are a JSON list.

use std::io::{Read, Write};

use bytes::{Buf, BufMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::block::DataBuffer;
use crate::container::{NativeAttribute, NativeScalar, NativeType, StorageFeatures};

/// Shape of a persisted attribute payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "shape")]
pub(crate) enum AttributeLayout {
    Scalar,
    Array,
    Matrix { rows: usize, cols: usize },
}

/// Encode an attribute's values; the layout and type are kept alongside.
pub(crate) fn encode_attribute(
    attr: &NativeAttribute,
) -> crate::Result<(AttributeLayout, NativeType, Vec<u8>)> {
    let (layout, bytes) = match attr {
        NativeAttribute::Scalar {
            value: NativeScalar::Bool(b),
        } => (AttributeLayout::Scalar, vec![u8::from(*b)]),
        NativeAttribute::Scalar { value } => {
            (AttributeLayout::Scalar, encode_values(&scalar_buffer(value)?)?)
        }
        NativeAttribute::Array { values } => (AttributeLayout::Array, encode_values(values)?),
        NativeAttribute::Matrix { rows, cols, values } => (
            AttributeLayout::Matrix {
                rows: *rows,
                cols: *cols,
            },
            encode_values(values)?,
        ),
    };
    Ok((layout, attr.native_type(), bytes))
}

pub(crate) fn decode_attribute(
    layout: AttributeLayout,
    native_type: NativeType,
    bytes: &[u8],
) -> crate::Result<NativeAttribute> {
    if native_type == NativeType::Bool {
        return match (layout, bytes) {
            (AttributeLayout::Scalar, [b]) => Ok(NativeAttribute::Scalar {
                value: NativeScalar::Bool(*b != 0),
            }),
            _ => Err(crate::Error::native("malformed boolean attribute")),
        };
    }
    let values = decode_values(bytes, native_type)?;
    match layout {
        AttributeLayout::Scalar => Ok(NativeAttribute::Scalar {
            value: buffer_scalar(values)?,
        }),
        AttributeLayout::Array => Ok(NativeAttribute::Array { values }),
        AttributeLayout::Matrix { rows, cols } => {
            if rows * cols != values.len() {
                return Err(crate::Error::native(format!(
                    "{rows}x{cols} matrix attribute holds {} values",
                    values.len()
                )));
            }
            Ok(NativeAttribute::Matrix { rows, cols, values })
        }
    }
}

fn scalar_buffer(value: &NativeScalar) -> crate::Result<DataBuffer> {
    let out = match value {
        NativeScalar::Int8(v) => DataBuffer::Int8(vec![*v]),
        NativeScalar::Int16(v) => DataBuffer::Int16(vec![*v]),
        NativeScalar::Int32(v) => DataBuffer::Int32(vec![*v]),
        NativeScalar::Int64(v) => DataBuffer::Int64(vec![*v]),
        NativeScalar::Uint8(v) => DataBuffer::Uint8(vec![*v]),
        NativeScalar::Uint16(v) => DataBuffer::Uint16(vec![*v]),
        NativeScalar::Uint32(v) => DataBuffer::Uint32(vec![*v]),
        NativeScalar::Uint64(v) => DataBuffer::Uint64(vec![*v]),
        NativeScalar::Float32(v) => DataBuffer::Float32(vec![*v]),
        NativeScalar::Float64(v) => DataBuffer::Float64(vec![*v]),
        NativeScalar::String(v) => DataBuffer::String(vec![v.clone()]),
        NativeScalar::Bool(_) => {
            return Err(crate::Error::native("booleans have no element buffer"));
        }
    };
    Ok(out)
}

fn buffer_scalar(values: DataBuffer) -> crate::Result<NativeScalar> {
    if values.len() != 1 {
        return Err(crate::Error::native(format!(
            "scalar attribute holds {} values",
            values.len()
        )));
    }
    macro_rules! single {
        ($variant:ident, $v:expr) => {
            $v.into_iter().next().map(NativeScalar::$variant)
        };
    }
    let scalar = match values {
        DataBuffer::Uint8(v) => single!(Uint8, v),
        DataBuffer::Uint16(v) => single!(Uint16, v),
        DataBuffer::Uint32(v) => single!(Uint32, v),
        DataBuffer::Uint64(v) => single!(Uint64, v),
        DataBuffer::Int8(v) => single!(Int8, v),
        DataBuffer::Int16(v) => single!(Int16, v),
        DataBuffer::Int32(v) => single!(Int32, v),
        DataBuffer::Int64(v) => single!(Int64, v),
        DataBuffer::Float32(v) => single!(Float32, v),
        DataBuffer::Float64(v) => single!(Float64, v),
        DataBuffer::String(v) => single!(String, v),
    };
    scalar.ok_or_else(|| crate::Error::native("empty scalar attribute"))
}

/// Elements without storage features: little-endian numbers or a string list.
fn encode_values(buffer: &DataBuffer) -> crate::Result<Vec<u8>> {
    match buffer {
        DataBuffer::String(_) => strings_to_bytes(buffer),
        _ => to_le_bytes(buffer),
    }
}

fn decode_values(bytes: &[u8], native_type: NativeType) -> crate::Result<DataBuffer> {
    match native_type {
        NativeType::VarString => strings_from_bytes(bytes),
        _ => from_le_bytes(bytes, native_type),
    }
}

/// Encode a chunk's elements for persistence.
pub(crate) fn encode_chunk(buffer: &DataBuffer, features: StorageFeatures) -> crate::Result<Vec<u8>> {
    match features {
        StorageFeatures::NoCompression => Ok(to_le_bytes(buffer)?),
        StorageFeatures::ShuffleDeflate { level } => {
            let size = buffer.native_type().size().ok_or_else(|| {
                crate::Error::native("shuffle requires fixed-size elements")
            })?;
            deflate(&shuffle(&to_le_bytes(buffer)?, size), level)
        }
        StorageFeatures::GenericNoCompression => Ok(strings_to_bytes(buffer)?),
        StorageFeatures::GenericDeflate { level } => deflate(&strings_to_bytes(buffer)?, level),
    }
}

/// Decode a persisted chunk into `len` elements of `native_type`.
pub(crate) fn decode_chunk(
    bytes: &[u8],
    native_type: NativeType,
    features: StorageFeatures,
    len: usize,
) -> crate::Result<DataBuffer> {
    let out = match features {
        StorageFeatures::NoCompression => from_le_bytes(bytes, native_type)?,
        StorageFeatures::ShuffleDeflate { .. } => {
            let size = native_type.size().ok_or_else(|| {
                crate::Error::native("shuffle requires fixed-size elements")
            })?;
            from_le_bytes(&unshuffle(&inflate(bytes)?, size), native_type)?
        }
        StorageFeatures::GenericNoCompression => strings_from_bytes(bytes)?,
        StorageFeatures::GenericDeflate { .. } => strings_from_bytes(&inflate(bytes)?)?,
    };
    if out.len() != len {
        return Err(crate::Error::native(format!(
            "chunk holds {} elements, expected {len}",
            out.len()
        )));
    }
    Ok(out)
}

fn to_le_bytes(buffer: &DataBuffer) -> crate::Result<Vec<u8>> {
    let size = buffer.native_type().size().unwrap_or(0);
    let mut out = Vec::with_capacity(buffer.len() * size);
    match buffer {
        DataBuffer::Uint8(v) => out.put_slice(v),
        DataBuffer::Uint16(v) => v.iter().for_each(|&x| out.put_u16_le(x)),
        DataBuffer::Uint32(v) => v.iter().for_each(|&x| out.put_u32_le(x)),
        DataBuffer::Uint64(v) => v.iter().for_each(|&x| out.put_u64_le(x)),
        DataBuffer::Int8(v) => v.iter().for_each(|&x| out.put_i8(x)),
        DataBuffer::Int16(v) => v.iter().for_each(|&x| out.put_i16_le(x)),
        DataBuffer::Int32(v) => v.iter().for_each(|&x| out.put_i32_le(x)),
        DataBuffer::Int64(v) => v.iter().for_each(|&x| out.put_i64_le(x)),
        DataBuffer::Float32(v) => v.iter().for_each(|&x| out.put_f32_le(x)),
        DataBuffer::Float64(v) => v.iter().for_each(|&x| out.put_f64_le(x)),
        DataBuffer::String(_) => {
            return Err(crate::Error::native(
                "variable-length strings have no fixed-size encoding",
            ));
        }
    }
    Ok(out)
}

fn from_le_bytes(mut bytes: &[u8], native_type: NativeType) -> crate::Result<DataBuffer> {
    let size = match native_type {
        NativeType::Bool | NativeType::VarString => {
            return Err(crate::Error::native(format!(
                "{native_type:?} chunks have no fixed-size encoding"
            )));
        }
        nt => nt.size().unwrap_or(1),
    };
    if bytes.len() % size != 0 {
        return Err(crate::Error::native(format!(
            "chunk of {} bytes is not a multiple of the element size {size}",
            bytes.len()
        )));
    }
    let n = bytes.len() / size;
    macro_rules! read_all {
        ($variant:ident, $get:ident) => {
            DataBuffer::$variant((0..n).map(|_| bytes.$get()).collect())
        };
    }
    let out = match native_type {
        NativeType::Uint8 => DataBuffer::Uint8(bytes.to_vec()),
        NativeType::Uint16 => read_all!(Uint16, get_u16_le),
        NativeType::Uint32 => read_all!(Uint32, get_u32_le),
        NativeType::Uint64 => read_all!(Uint64, get_u64_le),
        NativeType::Int8 => read_all!(Int8, get_i8),
        NativeType::Int16 => read_all!(Int16, get_i16_le),
        NativeType::Int32 => read_all!(Int32, get_i32_le),
        NativeType::Int64 => read_all!(Int64, get_i64_le),
        NativeType::Float32 => read_all!(Float32, get_f32_le),
        NativeType::Float64 => read_all!(Float64, get_f64_le),
        NativeType::Bool | NativeType::VarString => unreachable!("rejected above"),
    };
    Ok(out)
}

fn strings_to_bytes(buffer: &DataBuffer) -> crate::Result<Vec<u8>> {
    match buffer {
        DataBuffer::String(v) => Ok(serde_json::to_vec(v)?),
        other => Err(crate::Error::native(format!(
            "generic storage features expect strings, got {:?}",
            other.native_type()
        ))),
    }
}

fn strings_from_bytes(bytes: &[u8]) -> crate::Result<DataBuffer> {
    Ok(DataBuffer::String(serde_json::from_slice(bytes)?))
}

/// Group the k-th byte of every element together.
fn shuffle(bytes: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 {
        return bytes.to_vec();
    }
    let n = bytes.len() / element_size;
    let mut out = vec![0u8; bytes.len()];
    for (i, element) in bytes.chunks_exact(element_size).enumerate() {
        for (j, &b) in element.iter().enumerate() {
            out[j * n + i] = b;
        }
    }
    out
}

fn unshuffle(bytes: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 {
        return bytes.to_vec();
    }
    let n = bytes.len() / element_size;
    let mut out = vec![0u8; bytes.len()];
    for (j, plane) in bytes.chunks_exact(n.max(1)).take(element_size).enumerate() {
        for (i, &b) in plane.iter().enumerate() {
            out[i * element_size + j] = b;
        }
    }
    out
}

fn deflate(bytes: &[u8], level: u32) -> crate::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8]) -> crate::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

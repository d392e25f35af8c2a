use serde::Deserialize;
use serde::de::value::Error as ValueError;
use serde::de::{DeserializeOwned, IntoDeserializer};

use crate::container::NativeType;

/// A flat, typed element buffer in C order.
#[derive(Debug, Clone, PartialEq)]
pub enum DataBuffer {
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

macro_rules! impl_from_vec {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for DataBuffer {
                fn from(value: Vec<$ty>) -> Self {
                    DataBuffer::$variant(value)
                }
            }
        )*
    };
}

impl_from_vec!(
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => String,
);

/// Apply the same expression to the vector inside any variant.
macro_rules! with_values {
    ($buffer:expr, $v:ident => $body:expr) => {
        match $buffer {
            DataBuffer::Uint8($v) => $body,
            DataBuffer::Uint16($v) => $body,
            DataBuffer::Uint32($v) => $body,
            DataBuffer::Uint64($v) => $body,
            DataBuffer::Int8($v) => $body,
            DataBuffer::Int16($v) => $body,
            DataBuffer::Int32($v) => $body,
            DataBuffer::Int64($v) => $body,
            DataBuffer::Float32($v) => $body,
            DataBuffer::Float64($v) => $body,
            DataBuffer::String($v) => $body,
        }
    };
}

impl DataBuffer {
    /// A buffer of `len` zero values (empty strings for strings).
    pub fn zeros(native_type: NativeType, len: usize) -> crate::Result<Self> {
        let out = match native_type {
            NativeType::Uint8 => DataBuffer::Uint8(vec![0; len]),
            NativeType::Uint16 => DataBuffer::Uint16(vec![0; len]),
            NativeType::Uint32 => DataBuffer::Uint32(vec![0; len]),
            NativeType::Uint64 => DataBuffer::Uint64(vec![0; len]),
            NativeType::Int8 => DataBuffer::Int8(vec![0; len]),
            NativeType::Int16 => DataBuffer::Int16(vec![0; len]),
            NativeType::Int32 => DataBuffer::Int32(vec![0; len]),
            NativeType::Int64 => DataBuffer::Int64(vec![0; len]),
            NativeType::Float32 => DataBuffer::Float32(vec![0.0; len]),
            NativeType::Float64 => DataBuffer::Float64(vec![0.0; len]),
            NativeType::VarString => DataBuffer::String(vec![String::new(); len]),
            NativeType::Bool => {
                return Err(crate::Error::UnsupportedDataType(format!(
                    "no element buffer for native type {native_type:?}"
                )));
            }
        };
        Ok(out)
    }

    pub fn native_type(&self) -> NativeType {
        match self {
            DataBuffer::Uint8(_) => NativeType::Uint8,
            DataBuffer::Uint16(_) => NativeType::Uint16,
            DataBuffer::Uint32(_) => NativeType::Uint32,
            DataBuffer::Uint64(_) => NativeType::Uint64,
            DataBuffer::Int8(_) => NativeType::Int8,
            DataBuffer::Int16(_) => NativeType::Int16,
            DataBuffer::Int32(_) => NativeType::Int32,
            DataBuffer::Int64(_) => NativeType::Int64,
            DataBuffer::Float32(_) => NativeType::Float32,
            DataBuffer::Float64(_) => NativeType::Float64,
            DataBuffer::String(_) => NativeType::VarString,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements as JSON values. Non-finite floats become `null`.
    pub fn to_json_values(&self) -> Vec<serde_json::Value> {
        with_values!(self, v => v.iter().map(|x| serde_json::Value::from(x.clone())).collect())
    }

    /// Elements as `rows` JSON arrays of `cols` values.
    pub fn to_json_rows(&self, rows: usize, cols: usize) -> Vec<serde_json::Value> {
        split_rows(&self.to_json_values(), rows, cols)
            .into_iter()
            .map(serde_json::Value::Array)
            .collect()
    }

    /// Deserialize the elements as a sequence without a JSON detour, so non-finite
    /// floats survive.
    pub(crate) fn deserialize_seq<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        with_values!(self, v => deserialize_from(v.clone()))
    }

    /// Deserialize the elements as `rows` sequences of `cols` elements.
    pub(crate) fn deserialize_rows<T: DeserializeOwned>(
        &self,
        rows: usize,
        cols: usize,
    ) -> Result<T, ValueError> {
        with_values!(self, v => deserialize_from(split_rows(v, rows, cols)))
    }

    /// Copy a rectangular region of `src` into this buffer.
    ///
    /// Both buffers are C-order arrays of the given shapes;
    /// `extent` is the region shape, the offsets are its origin in each array.
    pub(crate) fn copy_region_from(
        &mut self,
        dst_shape: &[u64],
        dst_offset: &[u64],
        src: &DataBuffer,
        src_shape: &[u64],
        src_offset: &[u64],
        extent: &[u64],
    ) -> crate::Result<()> {
        macro_rules! copy {
            ($dst:expr, $src:expr; $($variant:ident),*) => {
                match ($dst, $src) {
                    $(
                        (DataBuffer::$variant(d), DataBuffer::$variant(s)) => {
                            copy_region(s, src_shape, src_offset, d, dst_shape, dst_offset, extent)
                        }
                    )*
                    (d, s) => {
                        return Err(crate::Error::native(format!(
                            "cannot copy {:?} elements into a {:?} buffer",
                            s.native_type(),
                            d.native_type()
                        )));
                    }
                }
            };
        }
        copy!(self, src; Uint8, Uint16, Uint32, Uint64, Int8, Int16, Int32, Int64, Float32, Float64, String);
        Ok(())
    }
}

/// Split row-major values into `rows` rows; zero columns still give `rows` empty rows.
fn split_rows<X: Clone>(values: &[X], rows: usize, cols: usize) -> Vec<Vec<X>> {
    if cols == 0 {
        return vec![Vec::new(); rows];
    }
    values.chunks(cols).map(<[X]>::to_vec).collect()
}

/// Deserialize `T` from any value serde can turn into a deserializer.
pub(crate) fn deserialize_from<'de, T, V>(values: V) -> Result<T, ValueError>
where
    T: Deserialize<'de>,
    V: IntoDeserializer<'de, ValueError>,
{
    T::deserialize(values.into_deserializer())
}

fn strides(shape: &[u64]) -> Vec<usize> {
    let mut out = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * shape[i + 1] as usize;
    }
    out
}

/// Copy a region between two C-order arrays, one contiguous row at a time.
fn copy_region<T: Clone>(
    src: &[T],
    src_shape: &[u64],
    src_offset: &[u64],
    dst: &mut [T],
    dst_shape: &[u64],
    dst_offset: &[u64],
    extent: &[u64],
) {
    let ndim = extent.len();
    if extent.contains(&0) {
        return;
    }
    if ndim == 0 {
        dst[0] = src[0].clone();
        return;
    }
    let last = ndim - 1;
    let row = extent[last] as usize;
    let src_strides = strides(src_shape);
    let dst_strides = strides(dst_shape);
    let mut index = vec![0u64; last];
    loop {
        let mut s = src_offset[last] as usize;
        let mut d = dst_offset[last] as usize;
        for axis in 0..last {
            s += (src_offset[axis] + index[axis]) as usize * src_strides[axis];
            d += (dst_offset[axis] + index[axis]) as usize * dst_strides[axis];
        }
        dst[d..d + row].clone_from_slice(&src[s..s + row]);

        let mut axis = last;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < extent[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

/// A block of a dataset, in N5 axis order.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    /// Actual extent; smaller than the nominal block size on trailing edges.
    pub size: Vec<u32>,
    pub grid_position: Vec<u64>,
    /// Elements in F order with respect to `size`, i.e. C order in the container.
    pub data: DataBuffer,
}

impl DataBlock {
    pub fn new(size: Vec<u32>, grid_position: Vec<u64>, data: DataBuffer) -> crate::Result<Self> {
        if size.len() != grid_position.len() {
            return Err(crate::Error::DimensionMismatch {
                expected: size.len(),
                actual: grid_position.len(),
            });
        }
        let num_elements: usize = size.iter().map(|&s| s as usize).product();
        if num_elements != data.len() {
            return Err(crate::Error::general(format!(
                "block of size {size:?} needs {num_elements} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            size,
            grid_position,
            data,
        })
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }
}

/// Offset and actual extent of a block, in N5 axis order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CroppedBlock {
    pub offset: Vec<u64>,
    pub size: Vec<u32>,
}

/// Locate a block on the grid and crop it to the dataset bounds.
///
/// All vectors are in N5 axis order. A grid position whose offset is not inside the
/// dataset in every axis is a caller error.
pub fn crop(
    grid_position: &[u64],
    dimensions: &[u64],
    block_size: &[u32],
) -> crate::Result<CroppedBlock> {
    let n = dimensions.len();
    for len in [grid_position.len(), block_size.len()] {
        if len != n {
            return Err(crate::Error::DimensionMismatch {
                expected: n,
                actual: len,
            });
        }
    }
    let mut offset = Vec::with_capacity(n);
    let mut size = Vec::with_capacity(n);
    for d in 0..n {
        let o = grid_position[d]
            .checked_mul(u64::from(block_size[d]))
            .filter(|&o| o < dimensions[d])
            .ok_or_else(|| crate::Error::OutOfRange {
                grid_position: grid_position.to_vec(),
                dimensions: dimensions.to_vec(),
            })?;
        // bounded by block_size, so always fits
        size.push((dimensions[d] - o).min(u64::from(block_size[d])) as u32);
        offset.push(o);
    }
    Ok(CroppedBlock { offset, size })
}

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::{borrow::Cow, fmt, str::FromStr};

/// The element type of a tensor, as written in the `dtype` field of a header
/// entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[non_exhaustive]
pub enum Dtype {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 64-bit integer.
    I64,
    /// 32-bit IEEE 754 float.
    F32,
    /// 64-bit IEEE 754 float.
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// The tag used in the header.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "U8",
            Self::I8 => "I8",
            Self::U16 => "U16",
            Self::I16 => "I16",
            Self::U32 => "U32",
            Self::I32 => "I32",
            Self::U64 => "U64",
            Self::I64 => "I64",
            Self::F32 => "F32",
            Self::F64 => "F64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a `dtype` tag is not one of the recognized [`Dtype`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownDtype(pub String);

impl fmt::Display for UnknownDtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown dtype tag {:?}", self.0)
    }
}

impl std::error::Error for UnknownDtype {}

impl FromStr for Dtype {
    type Err = UnknownDtype;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "U8" => Self::U8,
            "I8" => Self::I8,
            "U16" => Self::U16,
            "I16" => Self::I16,
            "U32" => Self::U32,
            "I32" => Self::I32,
            "U64" => Self::U64,
            "I64" => Self::I64,
            "F32" => Self::F32,
            "F64" => Self::F64,
            _ => return Err(UnknownDtype(s.to_string())),
        })
    }
}

/// A primitive element type that can be stored in, and viewed from, a
/// container.
///
/// Data is always stored little-endian, whatever the host byte order.
pub trait Element: bytemuck::Pod + fmt::Debug {
    /// The dtype tag written for this type.
    const DTYPE: Dtype;

    /// Decodes one element from the first `DTYPE.size()` bytes of `bytes`.
    ///
    /// Panics if `bytes` is shorter than one element.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encodes `src` into `dst`, which must be exactly
    /// `src.len() * DTYPE.size()` bytes long.
    fn write_le_slice(src: &[Self], dst: &mut [u8]);

    /// Wraps a slice of this type into the matching [`TensorData`] variant.
    fn into_data(data: Cow<'_, [Self]>) -> TensorData<'_>;
}

macro_rules! impl_element {
    ($elem:ty, $variant:ident, $read:ident, $write_into:ident) => {
        impl Element for $elem {
            const DTYPE: Dtype = Dtype::$variant;

            fn read_le(bytes: &[u8]) -> Self {
                LittleEndian::$read(bytes)
            }

            fn write_le_slice(src: &[Self], dst: &mut [u8]) {
                LittleEndian::$write_into(src, dst);
            }

            fn into_data(data: Cow<'_, [Self]>) -> TensorData<'_> {
                TensorData::$variant(data)
            }
        }
    };
}

impl Element for u8 {
    const DTYPE: Dtype = Dtype::U8;

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn write_le_slice(src: &[Self], dst: &mut [u8]) {
        dst.copy_from_slice(src);
    }

    fn into_data(data: Cow<'_, [Self]>) -> TensorData<'_> {
        TensorData::U8(data)
    }
}

impl Element for i8 {
    const DTYPE: Dtype = Dtype::I8;

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }

    fn write_le_slice(src: &[Self], dst: &mut [u8]) {
        dst.copy_from_slice(bytemuck::cast_slice(src));
    }

    fn into_data(data: Cow<'_, [Self]>) -> TensorData<'_> {
        TensorData::I8(data)
    }
}

impl_element!(u16, U16, read_u16, write_u16_into);
impl_element!(i16, I16, read_i16, write_i16_into);
impl_element!(u32, U32, read_u32, write_u32_into);
impl_element!(i32, I32, read_i32, write_i32_into);
impl_element!(u64, U64, read_u64, write_u64_into);
impl_element!(i64, I64, read_i64, write_i64_into);
impl_element!(f32, F32, read_f32, write_f32_into);
impl_element!(f64, F64, read_f64, write_f64_into);

macro_rules! tensor_data {
    ($($variant:ident($elem:ty)),* $(,)?) => {
        /// The elements of one tensor handed to a [`Builder`](crate::Builder).
        ///
        /// Each variant corresponds to one [`Dtype`]. Borrowed data is copied
        /// only when the container is built.
        #[derive(Clone, Debug, PartialEq)]
        #[non_exhaustive]
        pub enum TensorData<'a> {
            $(
                #[allow(missing_docs)]
                $variant(Cow<'a, [$elem]>),
            )*
        }

        impl TensorData<'_> {
            /// The dtype inferred from the element kind.
            pub fn dtype(&self) -> Dtype {
                match self {
                    $(Self::$variant(_) => Dtype::$variant,)*
                }
            }

            /// Number of elements.
            pub fn len(&self) -> usize {
                match self {
                    $(Self::$variant(data) => data.len(),)*
                }
            }

            /// Returns `true` if there are no elements.
            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub(crate) fn write_le(&self, dst: &mut [u8]) {
                match self {
                    $(Self::$variant(data) => <$elem as Element>::write_le_slice(data, dst),)*
                }
            }
        }
    };
}

tensor_data! {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl<'a, T: Element> From<&'a [T]> for TensorData<'a> {
    fn from(data: &'a [T]) -> Self {
        T::into_data(Cow::Borrowed(data))
    }
}

impl<'a, T: Element, const N: usize> From<&'a [T; N]> for TensorData<'a> {
    fn from(data: &'a [T; N]) -> Self {
        T::into_data(Cow::Borrowed(data.as_slice()))
    }
}

impl<'a, T: Element> From<&'a Vec<T>> for TensorData<'a> {
    fn from(data: &'a Vec<T>) -> Self {
        T::into_data(Cow::Borrowed(data.as_slice()))
    }
}

impl<T: Element> From<Vec<T>> for TensorData<'_> {
    fn from(data: Vec<T>) -> Self {
        T::into_data(Cow::Owned(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_tags_parse_back() {
        for dtype in [Dtype::U8, Dtype::I16, Dtype::U32, Dtype::I64, Dtype::F32, Dtype::F64] {
            assert_eq!(dtype.as_str().parse::<Dtype>().unwrap(), dtype);
        }
        assert_eq!("BF16".parse::<Dtype>(), Err(UnknownDtype("BF16".into())));
        assert!("i64".parse::<Dtype>().is_err());
    }

    #[test]
    fn dtype_is_inferred_from_element_kind() {
        let ints = [-1i64, 0, 1, 2];
        let data = TensorData::from(&ints);
        assert_eq!(data.dtype(), Dtype::I64);
        assert_eq!(data.len(), 4);

        let data = TensorData::from(vec![0.5f32; 3]);
        assert_eq!(data.dtype(), Dtype::F32);
        assert!(matches!(data, TensorData::F32(Cow::Owned(_))));
    }

    #[test]
    fn writes_little_endian() {
        let data = TensorData::from(&[0x0102_0304u32, 0xa0b0_c0d0]);
        let mut out = [0u8; 8];
        data.write_le(&mut out);
        assert_eq!(out, [4, 3, 2, 1, 0xd0, 0xc0, 0xb0, 0xa0]);

        let mut out = [0u8; 2];
        TensorData::from(&[-1i8, 5]).write_le(&mut out);
        assert_eq!(out, [0xff, 5]);
    }

    #[test]
    fn reads_little_endian() {
        assert_eq!(i64::read_le(&(-2i64).to_le_bytes()), -2);
        assert_eq!(f32::read_le(&1.5f32.to_le_bytes()), 1.5);
        assert_eq!(u16::read_le(&[0x34, 0x12]), 0x1234);
        assert_eq!(i8::read_le(&[0xfe]), -2);
    }
}

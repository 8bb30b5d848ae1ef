//! The textual header: a JSON object mapping tensor names to
//! [`TensorInfo`]s, plus an optional `__metadata__` string map.

use super::elements::Dtype;
use num_traits::ToPrimitive;
use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    ops::Range,
};
use thiserror::Error;

/// Reserved header key holding free-form string metadata.
pub const METADATA_KEY: &str = "__metadata__";

/// The serialized header length is padded with spaces to a multiple of this
/// value. A header that is already aligned still receives a full block of
/// padding.
pub const HEADER_ALIGN: usize = 8;

/// Free-form metadata stored under [`METADATA_KEY`].
pub type Metadata = BTreeMap<String, String>;

/// An error in the byte range of a tensor.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OffsetError {
    /// The range starts after it ends.
    #[error("tensor {tensor:?} has data_offsets [{begin}, {end}] with begin > end")]
    Reversed {
        /// Name of the tensor.
        tensor: String,
        /// Declared start.
        begin: usize,
        /// Declared end.
        end: usize,
    },
    /// The range ends past the payload.
    #[error("tensor {tensor:?} ends at byte {end} but the payload is {len} bytes")]
    OutOfBounds {
        /// Name of the tensor.
        tensor: String,
        /// Declared end.
        end: usize,
        /// Length of the payload.
        len: usize,
    },
    /// The range overlaps the preceding one (strict loading only).
    #[error("tensor {tensor:?} overlaps tensor {previous:?}")]
    Overlap {
        /// Name of the tensor.
        tensor: String,
        /// Name of the tensor it overlaps.
        previous: String,
    },
    /// The range leaves a hole after the preceding one (strict loading only).
    #[error("tensor {tensor:?} starts at byte {begin}, expected {expected}")]
    Gap {
        /// Name of the tensor.
        tensor: String,
        /// Where the previous tensor ended.
        expected: usize,
        /// Declared start.
        begin: usize,
    },
}

/// An error parsing the header of a container.
#[derive(Debug, Error)]
pub enum ParseHeaderError {
    /// The header is not valid UTF-8.
    #[error("header is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// The header is not valid JSON.
    #[error("header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The header is valid JSON, but not an object.
    #[error("header is not a JSON object")]
    NotObject,
    /// `__metadata__` is not a flat map of strings.
    #[error("__metadata__ must be an object of string values")]
    InvalidMetadata,
    /// A tensor has an empty name.
    #[error("tensor names must not be empty")]
    EmptyName,
    /// A tensor entry is not an object.
    #[error("entry for tensor {tensor:?} is not an object")]
    EntryNotObject {
        /// Name of the tensor.
        tensor: String,
    },
    /// A required field is missing from a tensor entry.
    #[error("tensor {tensor:?} is missing field {field:?}")]
    MissingField {
        /// Name of the tensor.
        tensor: String,
        /// The missing field.
        field: &'static str,
    },
    /// A tensor entry has a field that is not recognized.
    #[error("tensor {tensor:?} has unknown field {field:?}")]
    UnknownField {
        /// Name of the tensor.
        tensor: String,
        /// The unknown field.
        field: String,
    },
    /// A field holds a value of the wrong kind.
    #[error("tensor {tensor:?} has illegal value for {field:?}: {value}")]
    IllegalValue {
        /// Name of the tensor.
        tensor: String,
        /// The field holding the value.
        field: &'static str,
        /// The illegal value.
        value: Value,
    },
    /// The `dtype` tag is not recognized.
    #[error("tensor {tensor:?} has unsupported dtype {dtype:?}")]
    UnsupportedDtype {
        /// Name of the tensor.
        tensor: String,
        /// The unrecognized tag.
        dtype: String,
    },
    /// The element count or byte length of a tensor overflows `usize`.
    #[error("overflow computing the length of tensor {tensor:?}")]
    LengthOverflow {
        /// Name of the tensor.
        tensor: String,
    },
    /// The byte range does not match the shape and dtype.
    #[error("tensor {tensor:?} spans {actual} bytes but its shape and dtype need {expected}")]
    SizeMismatch {
        /// Name of the tensor.
        tensor: String,
        /// `element_count(shape) * dtype.size()`.
        expected: usize,
        /// `end - begin`.
        actual: usize,
    },
    /// The byte range is malformed.
    #[error(transparent)]
    Offset(#[from] OffsetError),
}

/// An error serializing a header.
#[derive(Debug, Error)]
pub enum FormatHeaderError {
    /// An error from the JSON serializer.
    #[error("error formatting header: {0}")]
    Json(#[from] serde_json::Error),
    /// The padded header length does not fit the 8-byte length prefix.
    #[error("the header is too long")]
    HeaderTooLong,
}

/// Describes one tensor: its dtype, its shape and where its bytes live in the
/// payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

impl TensorInfo {
    /// Element type.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Axis lengths. An empty shape denotes a scalar.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Half-open `(begin, end)` byte offsets relative to the payload start.
    pub fn data_offsets(&self) -> (usize, usize) {
        self.data_offsets
    }

    /// Byte range relative to the payload start.
    pub fn byte_range(&self) -> Range<usize> {
        self.data_offsets.0..self.data_offsets.1
    }

    /// Number of bytes of the tensor.
    pub fn nbytes(&self) -> usize {
        self.data_offsets.1 - self.data_offsets.0
    }

    /// Number of elements, i.e. the product of the shape (1 for a scalar).
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Builds a descriptor, checking the byte range against the shape.
    pub(crate) fn new(
        name: &str,
        dtype: Dtype,
        shape: Vec<usize>,
        data_offsets: (usize, usize),
    ) -> Result<Self, ParseHeaderError> {
        let (begin, end) = data_offsets;
        if begin > end {
            return Err(OffsetError::Reversed { tensor: name.to_string(), begin, end }.into());
        }
        let expected = byte_len(&shape, dtype).ok_or_else(|| ParseHeaderError::LengthOverflow {
            tensor: name.to_string(),
        })?;
        if expected != end - begin {
            return Err(ParseHeaderError::SizeMismatch {
                tensor: name.to_string(),
                expected,
                actual: end - begin,
            });
        }
        Ok(Self { dtype, shape, data_offsets })
    }
}

/// `element_count(shape) * dtype.size()`, or `None` on overflow.
pub(crate) fn byte_len(shape: &[usize], dtype: Dtype) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))?
        .checked_mul(dtype.size())
}

/// What to do with an entry whose dtype tag is not recognized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnknownDtypePolicy {
    Reject,
    Skip,
}

/// The tensor descriptors of a container, in header order.
///
/// A `Header` is only handed out by shared reference, so it cannot be
/// modified once a container exists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    tensors: Vec<(String, TensorInfo)>,
    index: HashMap<String, usize>,
    metadata: Option<Metadata>,
    /// Entries dropped for their dtype. They keep their bytes in the payload
    /// and are written back unchanged.
    skipped: Vec<(String, SkippedEntry)>,
    /// Largest `end` over every parsed entry, skipped ones included.
    extent: usize,
}

/// A tensor entry whose dtype tag is not recognized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct SkippedEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

impl Header {
    /// Parses a header from its serialized bytes. Trailing padding is
    /// ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseHeaderError> {
        Self::parse(bytes, UnknownDtypePolicy::Reject)
    }

    pub(crate) fn parse(
        bytes: &[u8],
        policy: UnknownDtypePolicy,
    ) -> Result<Self, ParseHeaderError> {
        let text = std::str::from_utf8(bytes)?;
        let Value::Object(entries) = serde_json::from_str::<Value>(text)? else {
            return Err(ParseHeaderError::NotObject);
        };
        let mut header = Self::default();
        for (name, value) in entries {
            if name == METADATA_KEY {
                header.metadata = Some(parse_metadata(value)?);
                continue;
            }
            if name.is_empty() {
                return Err(ParseHeaderError::EmptyName);
            }
            let Value::Object(fields) = value else {
                return Err(ParseHeaderError::EntryNotObject { tensor: name });
            };
            let raw = RawEntry::from_fields(&name, fields)?;
            let dtype = match raw.dtype.parse::<Dtype>() {
                Ok(dtype) => dtype,
                Err(_) if policy == UnknownDtypePolicy::Skip => {
                    let (begin, end) = raw.data_offsets;
                    if begin > end {
                        return Err(OffsetError::Reversed { tensor: name, begin, end }.into());
                    }
                    log::warn!("skipping tensor {name:?} with unsupported dtype {:?}", raw.dtype);
                    header.extent = header.extent.max(end);
                    let entry = SkippedEntry {
                        dtype: raw.dtype,
                        shape: raw.shape,
                        data_offsets: raw.data_offsets,
                    };
                    header.skipped.push((name, entry));
                    continue;
                }
                Err(err) => {
                    return Err(ParseHeaderError::UnsupportedDtype { tensor: name, dtype: err.0 })
                }
            };
            let info = TensorInfo::new(&name, dtype, raw.shape, raw.data_offsets)?;
            header.insert(name, info);
        }
        Ok(header)
    }

    /// Serializes the header, padded with spaces so that its length is a
    /// multiple of [`HEADER_ALIGN`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatHeaderError> {
        let mut out = serde_json::to_vec(self)?;
        let padding = HEADER_ALIGN - out.len() % HEADER_ALIGN;
        out.resize(out.len() + padding, b' ');
        debug_assert_eq!(out.len() % HEADER_ALIGN, 0);
        u64::try_from(out.len()).map_err(|_| FormatHeaderError::HeaderTooLong)?;
        Ok(out)
    }

    /// Looks up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&TensorInfo> {
        self.index.get(name).map(|&i| &self.tensors[i].1)
    }

    /// Returns `true` if a tensor with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates over the tensors in header order. Metadata is not included.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, &TensorInfo)> {
        self.tensors.iter().map(|(name, info)| (name.as_str(), info))
    }

    /// Tensor names in header order.
    pub fn names(&self) -> impl ExactSizeIterator<Item = &str> {
        self.tensors.iter().map(|(name, _)| name.as_str())
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Returns `true` if the header describes no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Names of the entries that were skipped for an unsupported dtype, in
    /// header order. They cannot be viewed, but are written back with the
    /// container.
    pub fn skipped(&self) -> impl ExactSizeIterator<Item = &str> {
        self.skipped.iter().map(|(name, _)| name.as_str())
    }

    /// Byte ranges of every entry, skipped ones included.
    pub(crate) fn ranges(&self) -> impl Iterator<Item = (&str, (usize, usize))> {
        let kept = self.iter().map(|(name, info)| (name, info.data_offsets));
        let skipped = self.skipped.iter().map(|(name, entry)| (name.as_str(), entry.data_offsets));
        kept.chain(skipped)
    }

    /// The `__metadata__` entry, if present.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Number of payload bytes the header refers to: the largest `end`
    /// offset, or 0 without tensors.
    pub fn payload_len(&self) -> usize {
        self.extent
    }

    /// Inserts a tensor. Returns `false`, leaving the header untouched, if the
    /// name is taken.
    pub(crate) fn insert(&mut self, name: String, info: TensorInfo) -> bool {
        if self.index.contains_key(&name) {
            return false;
        }
        self.extent = self.extent.max(info.data_offsets.1);
        self.index.insert(name.clone(), self.tensors.len());
        self.tensors.push((name, info));
        true
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        self.metadata.get_or_insert_with(Metadata::new)
    }
}

#[derive(Serialize)]
struct EntryRepr<'a> {
    dtype: Dtype,
    shape: &'a [usize],
    data_offsets: [usize; 2],
}

impl Serialize for Header {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.tensors.len() + self.skipped.len() + usize::from(self.metadata.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(metadata) = &self.metadata {
            map.serialize_entry(METADATA_KEY, metadata)?;
        }
        for (name, info) in &self.tensors {
            let entry = EntryRepr {
                dtype: info.dtype,
                shape: &info.shape,
                data_offsets: [info.data_offsets.0, info.data_offsets.1],
            };
            map.serialize_entry(name, &entry)?;
        }
        for (name, entry) in &self.skipped {
            map.serialize_entry(name, entry)?;
        }
        map.end()
    }
}

/// The fields of a tensor entry, before the dtype tag is resolved.
struct RawEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

impl RawEntry {
    fn from_fields(name: &str, fields: Map<String, Value>) -> Result<Self, ParseHeaderError> {
        let illegal = |field, value| ParseHeaderError::IllegalValue {
            tensor: name.to_string(),
            field,
            value,
        };
        let mut dtype = None;
        let mut shape = None;
        let mut data_offsets = None;
        for (key, value) in fields {
            match key.as_str() {
                "dtype" => match value {
                    Value::String(s) => dtype = Some(s),
                    value => return Err(illegal("dtype", value)),
                },
                "shape" => match parse_usizes(&value) {
                    Some(s) => shape = Some(s),
                    None => return Err(illegal("shape", value)),
                },
                "data_offsets" => match parse_usizes(&value).as_deref() {
                    Some(&[begin, end]) => data_offsets = Some((begin, end)),
                    _ => return Err(illegal("data_offsets", value)),
                },
                _ => {
                    return Err(ParseHeaderError::UnknownField {
                        tensor: name.to_string(),
                        field: key,
                    })
                }
            }
        }
        let missing = |field| ParseHeaderError::MissingField { tensor: name.to_string(), field };
        Ok(Self {
            dtype: dtype.ok_or_else(|| missing("dtype"))?,
            shape: shape.ok_or_else(|| missing("shape"))?,
            data_offsets: data_offsets.ok_or_else(|| missing("data_offsets"))?,
        })
    }
}

/// An array of non-negative integers that fit in `usize`.
fn parse_usizes(value: &Value) -> Option<Vec<usize>> {
    value
        .as_array()?
        .iter()
        .map(|elem| elem.as_u64()?.to_usize())
        .collect()
}

fn parse_metadata(value: Value) -> Result<Metadata, ParseHeaderError> {
    let Value::Object(fields) = value else {
        return Err(ParseHeaderError::InvalidMetadata);
    };
    fields
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            _ => Err(ParseHeaderError::InvalidMetadata),
        })
        .collect()
}

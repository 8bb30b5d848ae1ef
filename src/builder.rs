use crate::container::{
    header::{byte_len, FormatHeaderError, Header, TensorInfo, METADATA_KEY},
    Container, TensorData, WriteError, PREFIX_LEN,
};
use std::{io, path::Path};
use thiserror::Error;

/// An error adding a tensor to a [`Builder`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BuildError {
    /// The number of elements does not match the shape.
    #[error("tensor {tensor:?}: shape {shape:?} needs {expected} elements, got {len}")]
    ShapeMismatch {
        /// Name of the tensor.
        tensor: String,
        /// Requested shape.
        shape: Vec<usize>,
        /// Product of the shape.
        expected: usize,
        /// Number of elements supplied.
        len: usize,
    },
    /// A tensor with this name was already added.
    #[error("tensor {0:?} was already added")]
    DuplicateName(String),
    /// The tensor name is empty.
    #[error("tensor names must not be empty")]
    EmptyName,
    /// The tensor name is the reserved metadata key.
    #[error("{0:?} is reserved for metadata")]
    ReservedName(String),
    /// The element count or byte offsets overflow `usize`.
    #[error("overflow computing the layout of tensor {0:?}")]
    LengthOverflow(String),
}

/// Lays out tensors one after the other in a single payload.
///
/// Offsets are assigned in the order tensors are added. Data is borrowed (or
/// owned, see [`TensorData`]) until [`Builder::build`] copies it into the
/// payload.
///
/// # Example
///
/// ```
/// use tensorfile::Builder;
///
/// let ints = [-1i64, 0, 1, 2];
/// let mut builder = Builder::new();
/// builder
///     .add("some_ints", [1, 4], &ints)?
///     .add("some_floats", [1, 2, 2], vec![-1.0f32, 0.0, 1.0, 2.0])?;
/// builder.metadata("format", "pt");
///
/// let container = builder.build();
/// assert_eq!(container.header().get("some_floats").unwrap().data_offsets(), (32, 48));
/// # Ok::<_, tensorfile::BuildError>(())
/// ```
#[derive(Debug, Default)]
pub struct Builder<'data> {
    header: Header,
    data: Vec<TensorData<'data>>,
    len: usize,
}

impl<'data> Builder<'data> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tensor after the previously added ones.
    ///
    /// The dtype is inferred from the element type of `data`. On error the
    /// builder is left unchanged.
    pub fn add<S, D>(&mut self, name: &str, shape: S, data: D) -> Result<&mut Self, BuildError>
    where
        S: Into<Vec<usize>>,
        D: Into<TensorData<'data>>,
    {
        let shape = shape.into();
        let data = data.into();
        if name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        if name == METADATA_KEY {
            return Err(BuildError::ReservedName(name.to_string()));
        }
        if self.header.contains(name) {
            return Err(BuildError::DuplicateName(name.to_string()));
        }
        let overflow = || BuildError::LengthOverflow(name.to_string());
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(overflow)?;
        if expected != data.len() {
            return Err(BuildError::ShapeMismatch {
                tensor: name.to_string(),
                shape,
                expected,
                len: data.len(),
            });
        }
        let nbytes = byte_len(&shape, data.dtype()).ok_or_else(overflow)?;
        let end = self.len.checked_add(nbytes).ok_or_else(overflow)?;
        let info = TensorInfo::new(name, data.dtype(), shape, (self.len, end))
            .map_err(|_| overflow())?;
        self.header.insert(name.to_string(), info);
        self.data.push(data);
        self.len = end;
        Ok(self)
    }

    /// Sets an entry of the `__metadata__` map.
    pub fn metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.header.metadata_mut().insert(key.into(), value.into());
        self
    }

    /// The tensors added so far.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Exact size in bytes of the serialized container, without building it.
    pub fn content_length(&self) -> Result<usize, FormatHeaderError> {
        let header = self.header.to_bytes()?;
        PREFIX_LEN
            .checked_add(header.len())
            .and_then(|len| len.checked_add(self.len))
            .ok_or(FormatHeaderError::HeaderTooLong)
    }

    /// Copies every tensor into one little-endian payload.
    pub fn build(self) -> Container {
        let mut payload = vec![0; self.len];
        for ((_, info), data) in self.header.iter().zip(&self.data) {
            data.write_le(&mut payload[info.byte_range()]);
        }
        Container::from_parts(self.header, payload)
    }

    /// Builds the container and writes it to `writer`.
    pub fn write<W: io::Write>(self, writer: W) -> Result<(), WriteError> {
        self.build().write(writer)
    }

    /// Builds the container and saves it to `path`, creating or truncating
    /// the file.
    pub fn save<P: AsRef<Path>>(self, path: P) -> Result<(), WriteError> {
        crate::save(path, &self.build())
    }
}

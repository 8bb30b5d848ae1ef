mod elements;
pub mod header;

pub use self::elements::{Dtype, Element, TensorData, UnknownDtype};
use self::header::{
    FormatHeaderError, Header, OffsetError, ParseHeaderError, TensorInfo, UnknownDtypePolicy,
};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::{
    borrow::Cow,
    fmt,
    io::{self, Read, Write},
    marker::PhantomData,
};
use thiserror::Error;

/// Size of the little-endian `u64` header length that starts every container.
pub const PREFIX_LEN: usize = 8;

/// Default for [`LoadOptions::max_header_len`].
pub const DEFAULT_MAX_HEADER_LEN: u64 = 100_000_000;

/// Options controlling how a container is loaded.
///
/// # Example
///
/// ```
/// use tensorfile::LoadOptions;
///
/// let options = LoadOptions::default().with_strict(true).with_max_header_len(1 << 20);
/// assert!(options.strict());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    max_header_len: u64,
    strict: bool,
    skip_unsupported_dtypes: bool,
}

impl LoadOptions {
    /// Reject declared header lengths above `max_header_len` bytes before
    /// allocating anything.
    pub fn with_max_header_len(mut self, max_header_len: u64) -> Self {
        self.max_header_len = max_header_len;
        self
    }

    /// Require the byte ranges to tile the payload exactly: no overlap, no
    /// gap and no trailing bytes.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Drop entries with an unrecognized dtype instead of failing.
    pub fn with_skip_unsupported_dtypes(mut self, skip: bool) -> Self {
        self.skip_unsupported_dtypes = skip;
        self
    }

    /// Maximum accepted header length in bytes.
    pub fn max_header_len(&self) -> u64 {
        self.max_header_len
    }

    /// Whether byte ranges must tile the payload.
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Whether entries with an unrecognized dtype are skipped.
    pub fn skip_unsupported_dtypes(&self) -> bool {
        self.skip_unsupported_dtypes
    }

    fn dtype_policy(&self) -> UnknownDtypePolicy {
        if self.skip_unsupported_dtypes {
            UnknownDtypePolicy::Skip
        } else {
            UnknownDtypePolicy::Reject
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            strict: false,
            skip_unsupported_dtypes: false,
        }
    }
}

/// The part of a container that was being read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    /// The 8-byte header length.
    Prefix,
    /// The JSON header.
    Header,
    /// The tensor data.
    Payload,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Prefix => write!(f, "length prefix"),
            Self::Header => write!(f, "header"),
            Self::Payload => write!(f, "payload"),
        }
    }
}

/// An error loading a container.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReadError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The input ended early.
    #[error("truncated {section}: expected {expected} bytes, got {actual}")]
    Truncated {
        /// What was being read.
        section: Section,
        /// Bytes declared.
        expected: u64,
        /// Bytes available.
        actual: u64,
    },
    /// The declared header length exceeds [`LoadOptions::max_header_len`].
    #[error("header length {len} exceeds the limit of {limit} bytes")]
    HeaderTooLarge {
        /// Declared length.
        len: u64,
        /// Configured limit.
        limit: u64,
    },
    /// An error parsing the header.
    #[error("error parsing header: {0}")]
    ParseHeader(#[from] ParseHeaderError),
    /// A byte range does not fit the payload.
    #[error(transparent)]
    Offset(#[from] OffsetError),
    /// Bytes follow the last tensor (strict loading only).
    #[error("{0} extra bytes after the last tensor")]
    ExtraBytes(u64),
}

/// An error saving a container.
#[derive(Debug, Error)]
pub enum WriteError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An error formatting the header.
    #[error("error formatting header: {0}")]
    FormatHeader(#[from] FormatHeaderError),
}

/// An error accessing a tensor of a container.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ViewError {
    /// No tensor has this name.
    #[error("tensor not found: {0:?}")]
    NotFound(String),
    /// The tensor is stored with another dtype.
    #[error("tensor {tensor:?} has dtype {stored}, not {requested}")]
    TypeMismatch {
        /// Name of the tensor.
        tensor: String,
        /// Dtype declared in the header.
        stored: Dtype,
        /// Dtype asked for.
        requested: Dtype,
    },
}

/// A set of named tensors sharing one payload buffer.
///
/// A container is immutable: it is created by [`Builder::build`],
/// [`Container::read`] or [`Container::from_buffer`], and only hands out
/// shared views of its data. `B` is the owned buffer, a `Vec<u8>` unless the
/// container was created with [`Container::from_buffer`] (for example over a
/// memory-mapped file).
///
/// [`Builder::build`]: crate::Builder::build
#[derive(Clone, Debug)]
pub struct Container<B = Vec<u8>> {
    header: Header,
    buffer: B,
    /// Offset of the payload within `buffer`.
    data_start: usize,
}

impl Container {
    pub(crate) fn from_parts(header: Header, payload: Vec<u8>) -> Self {
        debug_assert!(header.payload_len() <= payload.len());
        Self { header, buffer: payload, data_start: 0 }
    }

    /// Reads a container from `reader` with default [`LoadOptions`].
    ///
    /// Exactly the prefix, the header and the payload are consumed; the
    /// reader is dropped before returning.
    ///
    /// # Example
    ///
    /// ```
    /// use tensorfile::{Builder, Container};
    ///
    /// let mut builder = Builder::new();
    /// builder.add("x", [3], &[1.0f32, 2.0, 3.0])?;
    /// let mut bytes = Vec::new();
    /// builder.write(&mut bytes)?;
    ///
    /// let container = Container::read(bytes.as_slice())?;
    /// assert_eq!(container.view::<f32>("x")?.to_vec(), [1.0, 2.0, 3.0]);
    /// # Ok::<_, Box<dyn std::error::Error>>(())
    /// ```
    pub fn read<R: Read>(reader: R) -> Result<Self, ReadError> {
        Self::read_with(reader, &LoadOptions::default())
    }

    /// Reads a container from `reader`.
    pub fn read_with<R: Read>(mut reader: R, options: &LoadOptions) -> Result<Self, ReadError> {
        let header_len = read_prefix(&mut reader)?;
        check_header_len(header_len, options)?;
        let header_bytes = read_section(&mut reader, header_len, Section::Header)?;
        let header = Header::parse(&header_bytes, options.dtype_policy())?;

        let payload_len = header.payload_len() as u64;
        let payload = read_section(&mut reader, payload_len, Section::Payload)?;
        if options.strict {
            check_tiling(&header, payload.len())?;
            let extra = io::copy(&mut reader, &mut io::sink())?;
            if extra > 0 {
                return Err(ReadError::ExtraBytes(extra));
            }
        }
        log::debug!(
            "read container: {} tensors, {header_len}-byte header, {payload_len}-byte payload",
            header.len(),
        );
        Ok(Self::from_parts(header, payload))
    }
}

impl<B: AsRef<[u8]>> Container<B> {
    /// Wraps a buffer holding a whole serialized container, without copying
    /// the payload, using default [`LoadOptions`].
    ///
    /// Bytes after the last tensor are ignored unless loading is strict.
    pub fn from_buffer(buffer: B) -> Result<Self, ReadError> {
        Self::from_buffer_with(buffer, &LoadOptions::default())
    }

    /// Wraps a buffer holding a whole serialized container.
    pub fn from_buffer_with(buffer: B, options: &LoadOptions) -> Result<Self, ReadError> {
        let bytes = buffer.as_ref();
        let header_len = read_prefix(&mut &*bytes)?;
        check_header_len(header_len, options)?;
        let available = (bytes.len() - PREFIX_LEN) as u64;
        if header_len > available {
            return Err(ReadError::Truncated {
                section: Section::Header,
                expected: header_len,
                actual: available,
            });
        }
        // header_len <= available, so it fits in usize
        let data_start = PREFIX_LEN + header_len as usize;
        let header = Header::parse(&bytes[PREFIX_LEN..data_start], options.dtype_policy())?;

        let payload_len = bytes.len() - data_start;
        check_bounds(&header, payload_len)?;
        // Skipped entries are not in the header but still need their bytes.
        if header.payload_len() > payload_len {
            return Err(ReadError::Truncated {
                section: Section::Payload,
                expected: header.payload_len() as u64,
                actual: payload_len as u64,
            });
        }
        if options.strict {
            check_tiling(&header, payload_len)?;
            let extra = payload_len - header.payload_len();
            if extra > 0 {
                return Err(ReadError::ExtraBytes(extra as u64));
            }
        }
        log::debug!(
            "mapped container: {} tensors, {header_len}-byte header, {payload_len}-byte payload",
            header.len(),
        );
        Ok(Self { header, buffer, data_start })
    }

    /// The tensor descriptors.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The payload bytes the header refers to, up to
    /// [`Header::payload_len`]. Trailing bytes of a buffer passed to
    /// [`Container::from_buffer`] are not included.
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.data_start..self.data_start + self.header.payload_len()]
    }

    fn info(&self, name: &str) -> Result<&TensorInfo, ViewError> {
        self.header.get(name).ok_or_else(|| ViewError::NotFound(name.to_string()))
    }

    /// The little-endian bytes of a tensor, without copying.
    pub fn raw_view(&self, name: &str) -> Result<&[u8], ViewError> {
        let info = self.info(name)?;
        Ok(&self.payload()[info.byte_range()])
    }

    /// A typed view of a tensor, without copying.
    ///
    /// Fails with [`ViewError::TypeMismatch`] if the tensor is not stored as
    /// `T`.
    pub fn view<T: Element>(&self, name: &str) -> Result<TensorView<'_, T>, ViewError> {
        let info = self.info(name)?;
        if info.dtype() != T::DTYPE {
            return Err(ViewError::TypeMismatch {
                tensor: name.to_string(),
                stored: info.dtype(),
                requested: T::DTYPE,
            });
        }
        let bytes = &self.payload()[info.byte_range()];
        Ok(TensorView { bytes, shape: info.shape(), _elem: PhantomData })
    }

    /// Writes the container: the length prefix, the padded header, then the
    /// payload. The writer is flushed and dropped before returning.
    ///
    /// The header is re-serialized, so its padding may differ from the one
    /// the container was loaded with. Entries skipped for their dtype are
    /// written back after the other tensors, together with their bytes.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), WriteError> {
        let header = self.header.to_bytes()?;
        writer.write_u64::<LittleEndian>(header.len() as u64)?;
        writer.write_all(&header)?;
        writer.write_all(self.payload())?;
        writer.flush()?;
        log::debug!(
            "wrote container: {} tensors, {}-byte header, {}-byte payload",
            self.header.len(),
            header.len(),
            self.header.payload_len(),
        );
        Ok(())
    }
}

/// A read-only, typed window into the payload of a [`Container`].
///
/// The view borrows the container, so it cannot outlive it. Elements are
/// decoded from little-endian on access, whatever the host byte order and
/// the alignment of the data.
#[derive(Clone, Copy)]
pub struct TensorView<'a, T> {
    bytes: &'a [u8],
    shape: &'a [usize],
    _elem: PhantomData<T>,
}

impl<'a, T: Element> TensorView<'a, T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / T::DTYPE.size()
    }

    /// Returns `true` if the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Axis lengths.
    pub fn shape(&self) -> &'a [usize] {
        self.shape
    }

    /// The underlying little-endian bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The element at flat index `index`, or `None` if out of bounds.
    pub fn get(&self, index: usize) -> Option<T> {
        let size = T::DTYPE.size();
        let start = index.checked_mul(size)?;
        self.bytes.get(start..start.checked_add(size)?).map(T::read_le)
    }

    /// Iterates over the elements in storage order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = T> + 'a {
        self.bytes.chunks_exact(T::DTYPE.size()).map(T::read_le)
    }

    /// Copies the elements into a `Vec`.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// Reinterprets the bytes as `&[T]` without copying.
    ///
    /// Returns `None` on big-endian hosts, where the stored bytes are not in
    /// native order, or if the data is not aligned for `T`.
    pub fn as_slice(&self) -> Option<&'a [T]> {
        if cfg!(target_endian = "big") {
            return None;
        }
        bytemuck::try_cast_slice(self.bytes).ok()
    }
}

impl<T: Element> fmt::Debug for TensorView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("dtype", &T::DTYPE)
            .field("shape", &self.shape)
            .field("data", &self.to_vec())
            .finish()
    }
}

impl<'a, T: Element> From<TensorView<'a, T>> for TensorData<'a> {
    /// Borrows the bytes of the view when they can be reinterpreted as `&[T]`,
    /// copies them otherwise.
    fn from(view: TensorView<'a, T>) -> Self {
        match view.as_slice() {
            Some(slice) => T::into_data(Cow::Borrowed(slice)),
            None => T::into_data(Cow::Owned(view.to_vec())),
        }
    }
}

fn read_prefix<R: Read>(reader: &mut R) -> Result<u64, ReadError> {
    let mut prefix = [0; PREFIX_LEN];
    let got = read_full(reader, &mut prefix)?;
    if got < PREFIX_LEN {
        return Err(ReadError::Truncated {
            section: Section::Prefix,
            expected: PREFIX_LEN as u64,
            actual: got as u64,
        });
    }
    Ok(LittleEndian::read_u64(&prefix))
}

/// Fills `buf` as far as the reader allows, retrying short reads. Returns the
/// number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Reads exactly `len` bytes. Memory grows with the data actually read, so a
/// bogus length cannot trigger a huge allocation up front.
fn read_section<R: Read>(reader: &mut R, len: u64, section: Section) -> Result<Vec<u8>, ReadError> {
    let mut buf = Vec::new();
    let actual = reader.take(len).read_to_end(&mut buf)? as u64;
    if actual < len {
        return Err(ReadError::Truncated { section, expected: len, actual });
    }
    Ok(buf)
}

fn check_header_len(len: u64, options: &LoadOptions) -> Result<(), ReadError> {
    if len > options.max_header_len {
        return Err(ReadError::HeaderTooLarge { len, limit: options.max_header_len });
    }
    Ok(())
}

fn check_bounds(header: &Header, payload_len: usize) -> Result<(), OffsetError> {
    for (name, info) in header.iter() {
        let (_, end) = info.data_offsets();
        if end > payload_len {
            return Err(OffsetError::OutOfBounds {
                tensor: name.to_string(),
                end,
                len: payload_len,
            });
        }
    }
    Ok(())
}

/// Checks that the byte ranges of all entries, skipped ones included, sorted
/// by start, follow each other without overlap or gap from offset 0.
fn check_tiling(header: &Header, payload_len: usize) -> Result<(), OffsetError> {
    let mut ranges: Vec<_> = header.ranges().collect();
    ranges.sort_by_key(|&(_, range)| range);
    let mut expected = 0;
    let mut previous: Option<&str> = None;
    for (name, (begin, end)) in ranges {
        if begin < expected {
            return Err(OffsetError::Overlap {
                tensor: name.to_string(),
                previous: previous.unwrap_or_default().to_string(),
            });
        }
        if begin > expected {
            return Err(OffsetError::Gap { tensor: name.to_string(), expected, begin });
        }
        expected = end;
        previous = Some(name);
    }
    debug_assert!(expected <= payload_len);
    Ok(())
}

#![doc = include_str!("../README.md")]
//! ## Reading
//!
//! - [`load`] / [`load_with`] read a file into an owned [`Container`]
//! - [`Container::read`] reads from any [`std::io::Read`]
//! - [`Container::from_buffer`] wraps an in-memory or memory-mapped buffer
//!   without copying the payload
//!
//! ## Viewing
//!
//! - [`Container::raw_view`] returns the little-endian bytes of a tensor
//! - [`Container::view`] returns a typed [`TensorView`], checked against the
//!   dtype stored in the header
//!
//! ## Writing
//!
//! - [`Builder`] lays out tensors and builds a [`Container`]
//! - [`save`] / [`Container::write`] serialize a container
//!
//! ## Format
//!
//! ```text
//! [0..8)    header length N, little-endian u64
//! [8..8+N)  UTF-8 JSON header, space-padded so that N % 8 == 0
//! [8+N..)   tensor payload, little-endian
//! ```
//!
//! Each header entry reads
//! `"name":{"dtype":"F32","shape":[2,2],"data_offsets":[begin,end]}` with
//! offsets relative to the start of the payload. The reserved key
//! `__metadata__` holds a flat string-to-string map.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs)]

mod builder;
mod container;

#[cfg(feature = "ndarray")]
mod impl_ndarray;

pub use crate::{
    builder::{BuildError, Builder},
    container::{
        header::{
            FormatHeaderError, Header, Metadata, OffsetError, ParseHeaderError, TensorInfo,
            HEADER_ALIGN, METADATA_KEY,
        },
        Container, Dtype, Element, LoadOptions, ReadError, Section, TensorData, TensorView,
        UnknownDtype, ViewError, WriteError, DEFAULT_MAX_HEADER_LEN, PREFIX_LEN,
    },
};
use std::{fs, io, path::Path};

/// Reads the container stored at `path`.
///
/// This is a convenience function for `File::open` followed by
/// [`Container::read`], with a buffered reader.
///
/// # Example
///
/// ```no_run
/// let container = tensorfile::load("model.safetensors")?;
/// for (name, info) in container.header().iter() {
///     println!("{name}: {} {:?}", info.dtype(), info.shape());
/// }
/// # Ok::<_, tensorfile::ReadError>(())
/// ```
pub fn load<P: AsRef<Path>>(path: P) -> Result<Container, ReadError> {
    load_with(path, &LoadOptions::default())
}

/// Reads the container stored at `path` with the given options.
pub fn load_with<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<Container, ReadError> {
    let file = fs::File::open(path)?;
    Container::read_with(io::BufReader::new(file), options)
}

/// Writes a container to a file at `path`.
///
/// The file is created if it does not exist and truncated if it does.
pub fn save<P, B>(path: P, container: &Container<B>) -> Result<(), WriteError>
where
    P: AsRef<Path>,
    B: AsRef<[u8]>,
{
    let path = path.as_ref();
    if path.exists() {
        log::info!("{} exists, replacing", path.display());
    }
    container.write(io::BufWriter::new(fs::File::create(path)?))
}

//! End-to-end tests over files on disk.

use memmap2::Mmap;
use std::{fs, io::Write as _};
use tensorfile::{
    load, load_with, save, BuildError, Builder, Container, Dtype, LoadOptions, ReadError,
    Section, ViewError, METADATA_KEY,
};

fn header_len(bytes: &[u8]) -> usize {
    u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize
}

#[test]
fn sample_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.safetensors");

    let mut builder = Builder::new();
    builder
        .add("some_ints", [1, 4], &[-1i64, 0, 1, 2])
        .unwrap()
        .add("some_floats", [1, 2, 2], &[-1.0f32, 0.0, 1.0, 2.0])
        .unwrap();
    let expected_len = builder.content_length().unwrap();
    builder.save(&path).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len() as usize, expected_len);

    let sample = load(&path).unwrap();
    let ints = sample.header().get("some_ints").unwrap();
    assert_eq!(ints.shape(), [1, 4]);
    assert_eq!(ints.dtype(), Dtype::I64);
    let view = sample.view::<i64>("some_ints").unwrap();
    assert_eq!(view.len(), 4);
    assert_eq!(view.to_vec(), [-1, 0, 1, 2]);

    let floats = sample.header().get("some_floats").unwrap();
    assert_eq!(floats.shape(), [1, 2, 2]);
    let view = sample.view::<f32>("some_floats").unwrap();
    assert_eq!(view.len(), 4);
    assert_eq!(view.to_vec(), [-1.0, 0.0, 1.0, 2.0]);

    assert!(matches!(
        sample.view::<i64>("some_floats"),
        Err(ViewError::TypeMismatch { stored: Dtype::F32, requested: Dtype::I64, .. })
    ));
}

#[test]
fn saving_a_loaded_container_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.safetensors");
    let second = dir.path().join("second.safetensors");

    let weights: Vec<f64> = (0..12).map(|i| f64::from(i) * 0.25).collect();
    let mut builder = Builder::new();
    builder.add("weights", [3, 4], &weights).unwrap();
    builder.add("bias", [3], vec![1u32, 2, 3]).unwrap();
    builder.add("step", [], &[7i16]).unwrap();
    builder.metadata("format", "pt");
    builder.save(&first).unwrap();

    let loaded = load(&first).unwrap();
    save(&second, &loaded).unwrap();
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());

    let reloaded = load(&second).unwrap();
    assert_eq!(reloaded.header(), loaded.header());
    assert_eq!(reloaded.payload(), loaded.payload());
    assert_eq!(reloaded.view::<f64>("weights").unwrap().to_vec(), weights);
    assert_eq!(reloaded.header().metadata().unwrap()["format"], "pt");
}

#[test]
fn metadata_is_not_a_tensor() {
    let header = r#"{"__metadata__":{"foo":"bar"},"t":{"dtype":"I32","shape":[2],"data_offsets":[0,8]}}"#;
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&5i32.to_le_bytes());
    bytes.extend_from_slice(&(-6i32).to_le_bytes());

    let container = Container::read(bytes.as_slice()).unwrap();
    assert_eq!(container.header().names().collect::<Vec<_>>(), ["t"]);
    assert_eq!(container.header().metadata().unwrap()["foo"], "bar");
    assert_eq!(
        container.raw_view(METADATA_KEY).unwrap_err(),
        ViewError::NotFound(METADATA_KEY.into())
    );
    assert_eq!(container.view::<i32>("t").unwrap().to_vec(), [5, -6]);
}

#[test]
fn truncated_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.safetensors");

    let header = br#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[0,1]}}"#;
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(&4096u64.to_le_bytes()).unwrap();
    file.write_all(header).unwrap();
    drop(file);

    match load(&path) {
        Err(ReadError::Truncated { section, expected, actual }) => {
            assert_eq!(section, Section::Header);
            assert_eq!(expected, 4096);
            assert_eq!(actual, header.len() as u64);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Missing payload bytes.
    let mut builder = Builder::new();
    builder.add("t", [4], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    builder.save(&path).unwrap();
    let full = fs::read(&path).unwrap();
    fs::write(&path, &full[..full.len() - 3]).unwrap();
    assert!(matches!(
        load(&path),
        Err(ReadError::Truncated { section: Section::Payload, expected: 16, actual: 13 })
    ));
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(load(dir.path().join("absent")), Err(ReadError::Io(_))));
}

#[test]
fn failed_add_keeps_prior_state() {
    let mut builder = Builder::new();
    builder.add("first", [2], &[1i64, 2]).unwrap();
    let err = builder.add("broken", [2, 3], &[0i64; 5]).unwrap_err();
    assert!(matches!(&err, BuildError::ShapeMismatch { tensor, .. } if tensor == "broken"));

    let container = builder.build();
    assert_eq!(container.header().len(), 1);
    assert_eq!(container.payload().len(), 16);
    assert!(matches!(container.raw_view("broken"), Err(ViewError::NotFound(_))));
}

#[test]
fn padding_and_bounds_hold_for_many_layouts() {
    for count in 0..20usize {
        let mut builder = Builder::new();
        for i in 0..count {
            let name = "t".repeat(i + 1);
            builder.add(&name, [i], vec![i as u8; i]).unwrap();
        }
        let mut bytes = Vec::new();
        builder.write(&mut bytes).unwrap();

        let len = header_len(&bytes);
        assert_eq!(len % 8, 0);
        assert!(len >= 8);
        assert_eq!(&bytes[8 + len - 1..8 + len], b" ");

        let container = Container::read(bytes.as_slice()).unwrap();
        let payload_len = container.payload().len();
        for (name, info) in container.header().iter() {
            let (begin, end) = info.data_offsets();
            assert!(begin <= end && end <= payload_len, "{name}");
            assert_eq!(info.element_count() * info.dtype().size(), info.nbytes());
        }
    }
}

#[test]
fn memory_mapped_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapped.safetensors");
    let values: Vec<i64> = (-50..50).collect();
    let mut builder = Builder::new();
    builder.add("values", [10, 10], &values).unwrap();
    builder.add("flags", [4], &[1u8, 0, 1, 1]).unwrap();
    builder.save(&path).unwrap();

    let file = fs::File::open(&path).unwrap();
    let mmap = unsafe { Mmap::map(&file).unwrap() };
    let container = Container::from_buffer(mmap).unwrap();

    let view = container.view::<i64>("values").unwrap();
    assert_eq!(view.shape(), [10, 10]);
    assert_eq!(view.get(0), Some(-50));
    assert_eq!(view.iter().sum::<i64>(), values.iter().sum::<i64>());
    assert_eq!(container.raw_view("flags").unwrap(), [1, 0, 1, 1]);
}

#[test]
fn strict_loading_of_well_formed_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strict.safetensors");
    let mut builder = Builder::new();
    builder.add("a", [3], &[1u16, 2, 3]).unwrap();
    builder.add("b", [1], &[4.0f32]).unwrap();
    builder.save(&path).unwrap();

    let strict = LoadOptions::default().with_strict(true);
    let container = load_with(&path, &strict).unwrap();
    assert_eq!(container.view::<f32>("b").unwrap().to_vec(), [4.0]);

    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"junk").unwrap();
    drop(file);
    assert!(load(&path).is_ok());
    assert!(matches!(load_with(&path, &strict), Err(ReadError::ExtraBytes(4))));
}

#[test]
fn saving_over_a_larger_file_truncates_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replaced.safetensors");

    let mut large = Builder::new();
    large.add("big", [64], vec![3.0f64; 64]).unwrap();
    large.metadata("note", "first");
    large.save(&path).unwrap();

    let mut small = Builder::new();
    small.add("small", [2], &[1u8, 2]).unwrap();
    let expected_len = small.content_length().unwrap();
    let container = small.build();
    save(&path, &container).unwrap();

    assert_eq!(fs::metadata(&path).unwrap().len() as usize, expected_len);
    let reloaded = load_with(&path, &LoadOptions::default().with_strict(true)).unwrap();
    assert_eq!(reloaded.header().names().collect::<Vec<_>>(), ["small"]);
    assert!(reloaded.header().metadata().is_none());
    assert_eq!(reloaded.raw_view("small").unwrap(), [1, 2]);
}

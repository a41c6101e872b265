#![cfg(not(target_arch = "wasm32"))]

use std::io::{Read as _, Write as _};

use crashblk_storage::{BackingStore, BlockBackend, StorageError, WriteFencedBackend};

const DISK_SIZE: u64 = 100 * 1024 * 1024;

fn sparse_image(len: u64) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(len).unwrap();
    file
}

fn head(image: &tempfile::NamedTempFile) -> [u8; 4096] {
    let mut buf = [0u8; 4096];
    std::fs::File::open(image.path())
        .unwrap()
        .read_exact(&mut buf)
        .unwrap();
    buf
}

#[test]
fn open_reports_size_and_path() {
    let image = sparse_image(DISK_SIZE);
    let store = BackingStore::open(image.path()).unwrap();
    assert_eq!(store.size_bytes(), DISK_SIZE);
    assert_eq!(store.path(), image.path());
}

#[test]
fn open_missing_file_is_an_open_failure() {
    let dir = tempfile::tempdir().unwrap();
    let err = BackingStore::open(dir.path().join("missing.img")).unwrap_err();
    assert!(matches!(err, StorageError::Open { .. }), "{err:?}");
}

#[test]
fn store_roundtrips_at_offsets() {
    let image = sparse_image(1024 * 1024);
    let store = BackingStore::open(image.path()).unwrap();

    let data = b"hello backing store";
    assert_eq!(store.write_at(data, 123_456).unwrap(), data.len());
    store.flush().unwrap();

    let mut back = vec![0u8; data.len()];
    store.read_at(&mut back, 123_456).unwrap();
    assert_eq!(back, data);
}

#[test]
fn read_past_end_fails() {
    let image = sparse_image(1024);
    let store = BackingStore::open(image.path()).unwrap();
    let mut buf = [0u8; 200];
    let err = store.read_at(&mut buf, 900).unwrap_err();
    assert!(matches!(err, StorageError::Io(_)), "{err:?}");
}

// 100 MiB image: write 4 KiB, fence, rewrite, unfence, rewrite.
#[test]
fn fenced_write_does_not_reach_the_file() {
    let mut image = sparse_image(DISK_SIZE);
    image.as_file_mut().write_all(&[0x11; 4096]).unwrap();

    let backend = WriteFencedBackend::new(BackingStore::open(image.path()).unwrap());
    let payload = [0x22u8; 4096];
    assert_eq!(backend.write_at(&payload, 0).unwrap(), 4096);

    backend.toggle();
    let err = backend.write_at(&[0x33u8; 4096], 0).unwrap_err();
    assert!(err.is_permission_denied());

    assert_eq!(std::fs::metadata(image.path()).unwrap().len(), DISK_SIZE);
    assert_eq!(head(&image), payload);

    let mut buf = [0u8; 4096];
    backend.read_at(&mut buf, 0).unwrap();
    assert_eq!(buf, payload);

    backend.toggle();
    assert_eq!(backend.write_at(&[0x33u8; 4096], 0).unwrap(), 4096);
    assert!(head(&image).iter().all(|b| *b == 0x33));
}

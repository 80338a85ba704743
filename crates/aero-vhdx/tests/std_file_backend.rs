#![cfg(not(target_arch = "wasm32"))]

use aero_vhdx::{
    DiskError, StdFileBackend, StorageBackend, VhdxCreateOptions, VhdxDisk, VhdxOpenOptions,
    VirtualDisk,
};

use std::io::Write as _;

#[cfg(any(unix, windows))]
use std::io::{Seek, SeekFrom};

const MIB: u64 = 1024 * 1024;

#[test]
fn std_file_backend_set_len_write_read_roundtrip() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);

    backend.set_len(4096).unwrap();
    assert_eq!(backend.len().unwrap(), 4096);

    let data = b"hello std file backend";
    backend.write_at(123, data).unwrap();

    let mut back = vec![0u8; data.len()];
    backend.read_at(123, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn std_file_backend_grows_with_zeroes() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);
    assert!(backend.grows_zeroed());

    backend.set_len(2 * MIB).unwrap();
    let mut hole = vec![0xAAu8; 4096];
    backend.read_at(MIB, &mut hole).unwrap();
    assert!(hole.iter().all(|b| *b == 0));
}

#[test]
fn std_file_backend_read_oob_returns_out_of_bounds() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);

    backend.set_len(1024).unwrap();

    let mut buf = [0u8; 200];
    let err = backend.read_at(900, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
}

#[cfg(any(unix, windows))]
#[test]
fn std_file_backend_does_not_disturb_file_cursor() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[0u8; 16]).unwrap();
    file.seek(SeekFrom::Start(5)).unwrap();
    let before = file.stream_position().unwrap();

    let mut backend = StdFileBackend::from_file(file);
    let mut buf = [0u8; 4];
    backend.read_at(0, &mut buf).unwrap();
    backend.write_at(8, &[1, 2, 3, 4]).unwrap();
    backend.flush().unwrap();

    let mut file = backend.into_file();
    let after = file.stream_position().unwrap();
    assert_eq!(before, after);
}

#[test]
fn std_file_backend_offset_overflow_is_reported() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);

    let mut buf = [0u8; 2];

    let err = backend.read_at(u64::MAX, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OffsetOverflow));

    let err = backend.write_at(u64::MAX - 1, &buf).unwrap_err();
    assert!(matches!(err, DiskError::OffsetOverflow));
}

#[test]
fn vhdx_on_host_file_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vhdx");

    let backend = StdFileBackend::create(&path).unwrap();
    let options = VhdxCreateOptions {
        block_size_bytes: MIB as u32,
        ..VhdxCreateOptions::new(8 * MIB)
    };
    let mut disk = VhdxDisk::create(backend, options).unwrap();

    let pattern: Vec<u8> = (0..3 * 4096).map(|i| (i % 251) as u8).collect();
    // Straddles the boundary between payload blocks 1 and 2.
    let offset = 2 * MIB - 4096;
    disk.write_at(offset, &pattern).unwrap();
    disk.close().unwrap();

    // Data region starts at 4 MiB; two blocks were appended.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 6 * MIB);

    let backend = StdFileBackend::open_read_only(&path).unwrap();
    let mut disk = VhdxDisk::open_with_options(
        backend,
        VhdxOpenOptions {
            read_only: true,
            ..VhdxOpenOptions::default()
        },
    )
    .unwrap();
    assert_eq!(disk.info().allocated_blocks, 2);

    let mut back = vec![0u8; pattern.len()];
    disk.read_at(offset, &mut back).unwrap();
    assert_eq!(back, pattern);

    let mut untouched = vec![0xAAu8; 4096];
    disk.read_at(6 * MIB, &mut untouched).unwrap();
    assert!(untouched.iter().all(|b| *b == 0));

    let err = disk.write_at(0, &[1]).unwrap_err();
    assert!(matches!(err, DiskError::ReadOnly));
}

#[test]
fn vhdx_create_truncates_existing_file() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0x77u8; 20 * MIB as usize]).unwrap();
    tmp.flush().unwrap();

    let backend = StdFileBackend::open(tmp.path()).unwrap();
    let disk = VhdxDisk::create(backend, VhdxCreateOptions::new(MIB)).unwrap();
    drop(disk.close().unwrap());

    // 1 MiB log, 1 MiB BAT, 1 MiB metadata after the header section.
    assert_eq!(std::fs::metadata(tmp.path()).unwrap().len(), 4 * MIB);
}

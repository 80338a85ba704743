use aero_vhdx::{
    CheckMode, DiskError, MemBackend, PayloadState, StorageBackend, VhdxCreateOptions, VhdxDisk,
    VhdxOpenOptions, VirtualDisk,
};

const MIB: u64 = 1024 * 1024;
const BAT_OFFSET: u64 = 2 * MIB;
const DATA_OFFSET: u64 = 4 * MIB;

fn new_disk(size: u64) -> VhdxDisk<MemBackend> {
    VhdxDisk::create(MemBackend::new(), create_options(size)).unwrap()
}

fn create_options(size: u64) -> VhdxCreateOptions {
    VhdxCreateOptions {
        block_size_bytes: MIB as u32,
        ..VhdxCreateOptions::new(size)
    }
}

/// Rejects payload writes that start at one offset.
struct FailingPayload {
    inner: MemBackend,
    fail_write_at: Option<u64>,
}

impl StorageBackend for FailingPayload {
    fn len(&mut self) -> aero_vhdx::Result<u64> {
        self.inner.len()
    }

    fn set_len(&mut self, len: u64) -> aero_vhdx::Result<()> {
        self.inner.set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> aero_vhdx::Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> aero_vhdx::Result<()> {
        if self.fail_write_at == Some(offset) {
            return Err(DiskError::Io(format!("write refused at {offset:#x}")));
        }
        self.inner.write_at(offset, buf)
    }

    fn flush(&mut self) -> aero_vhdx::Result<()> {
        self.inner.flush()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_allocate_distinct_blocks() {
    let shared = new_disk(16 * MIB).into_shared();

    let mut tasks = Vec::new();
    for block in 0..16u64 {
        let disk = shared.clone();
        tasks.push(tokio::spawn(async move {
            // Each writer straddles into the next block so neighbours race on allocation.
            let offset = block * MIB + MIB / 2;
            let len = if block == 15 { MIB / 2 } else { MIB };
            let data = vec![block as u8 + 1; len as usize];
            disk.write_at(offset, &data).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let info = shared.info().await;
    assert_eq!(info.allocated_blocks, 16);
    let report = shared.check(CheckMode::All).await.unwrap();
    assert_eq!(report.corruptions_found, 0);

    let mut first_half = vec![0xFFu8; (MIB / 2) as usize];
    shared.read_at(0, &mut first_half).await.unwrap();
    assert!(first_half.iter().all(|b| *b == 0));

    let backend = shared.close().await.unwrap();
    let mut disk = VhdxDisk::open(backend).unwrap();
    for block in 0..16u64 {
        let mut buf = vec![0u8; (MIB / 2) as usize];
        disk.read_at(block * MIB + MIB / 2, &mut buf).unwrap();
        assert!(
            buf.iter().all(|b| *b == block as u8 + 1),
            "block {block} second half"
        );
    }
}

#[tokio::test]
async fn shared_reads_see_prior_writes() {
    let shared = new_disk(4 * MIB).into_shared();
    assert_eq!(shared.capacity_bytes(), 4 * MIB);

    shared.write_at(3 * MIB - 2, b"abcd").await.unwrap();
    let mut buf = [0u8; 4];
    shared.read_at(3 * MIB - 2, &mut buf).await.unwrap();
    assert_eq!(&buf, b"abcd");

    let err = shared.write_at(4 * MIB, &[1]).await.unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
    shared.flush().await.unwrap();
}

#[tokio::test]
async fn close_requires_last_handle() {
    let shared = new_disk(MIB).into_shared();
    let other = shared.clone();

    let err = shared.close().await.err().unwrap();
    assert!(matches!(err, DiskError::InvalidConfig(_)));

    other.write_at(0, b"x").await.unwrap();
    let backend = other.close().await.unwrap();
    let mut disk = VhdxDisk::open(backend).unwrap();
    let mut byte = [0u8];
    disk.read_at(0, &mut byte).unwrap();
    assert_eq!(&byte, b"x");
}

#[tokio::test]
async fn read_only_shared_handle_rejects_writes() {
    let backend = new_disk(MIB).close().unwrap();
    let disk = VhdxDisk::open_with_options(
        backend,
        VhdxOpenOptions {
            read_only: true,
            ..VhdxOpenOptions::default()
        },
    )
    .unwrap();
    let shared = disk.into_shared();

    let err = shared.write_at(0, &[1]).await.unwrap_err();
    assert!(matches!(err, DiskError::ReadOnly));
    shared.flush().await.unwrap();
    let mut buf = [0xFFu8; 16];
    shared.read_at(0, &mut buf).await.unwrap();
    assert_eq!(buf, [0u8; 16]);
}

#[tokio::test]
async fn failed_payload_write_restores_not_present_entry() {
    let backend = FailingPayload {
        inner: MemBackend::new(),
        fail_write_at: None,
    };
    let mut disk = VhdxDisk::create(backend, create_options(4 * MIB)).unwrap();
    // The first block lands at DATA_OFFSET and the payload starts 512 bytes into it.
    disk.backend_mut().fail_write_at = Some(DATA_OFFSET + 512);
    let shared = disk.into_shared();

    let err = shared.write_at(512, &[0xCD; 2048]).await.unwrap_err();
    assert!(matches!(err, DiskError::Io(_)));
    assert_eq!(shared.info().await.allocated_blocks, 0);

    let mut buf = [0xFFu8; 2048];
    shared.read_at(512, &mut buf).await.unwrap();
    assert_eq!(buf, [0u8; 2048]);

    // Other blocks keep working after the rollback.
    shared.write_at(MIB, b"next").await.unwrap();
    assert_eq!(shared.info().await.allocated_blocks, 1);

    let backend = shared.close().await.unwrap().inner;
    let at = BAT_OFFSET as usize;
    let raw = u64::from_le_bytes(backend.as_slice()[at..at + 8].try_into().unwrap());
    assert_eq!(raw, 0);

    let mut disk = VhdxDisk::open(backend).unwrap();
    assert_eq!(
        disk.bat_entry(0).unwrap().state(),
        Some(PayloadState::NotPresent)
    );
    let mut word = [0u8; 4];
    disk.read_at(MIB, &mut word).unwrap();
    assert_eq!(&word, b"next");
}

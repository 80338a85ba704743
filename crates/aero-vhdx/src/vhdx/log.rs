//! Contract with the metadata log.
//!
//! The image layer never interprets log contents. It hands every metadata change to a
//! [`MetadataLog`] before the payload write that depends on it, and asks the log to replay
//! itself once at open.

use std::collections::VecDeque;

use tracing::debug;

use super::header::VhdxHeader;
use crate::{DiskError, FormatError, Result, StorageBackend};

pub const LOG_ENTRY_SIGNATURE: [u8; 4] = *b"loge";

/// A metadata update: `data` must end up at `file_offset` once the log is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub file_offset: u64,
    pub data: Vec<u8>,
}

pub trait MetadataLog: Send {
    /// Bring the image up to date with any committed log entries.
    ///
    /// Returns `true` when entries were applied. A read-only open must fail rather than replay.
    fn replay(
        &mut self,
        backend: &mut dyn StorageBackend,
        header: &VhdxHeader,
        read_only: bool,
    ) -> Result<bool>;

    fn append(&mut self, backend: &mut dyn StorageBackend, record: LogRecord) -> Result<()>;

    /// Make every appended record durable.
    ///
    /// Records that could not be written stay queued, in order, for the next flush.
    fn flush(&mut self, backend: &mut dyn StorageBackend) -> Result<()>;
}

/// A log without a journal: records are written in place on flush.
///
/// Images that carry pending log entries cannot be opened with it.
#[derive(Debug, Default)]
pub struct DirectLog {
    pending: VecDeque<LogRecord>,
}

impl DirectLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataLog for DirectLog {
    fn replay(
        &mut self,
        backend: &mut dyn StorageBackend,
        header: &VhdxHeader,
        _read_only: bool,
    ) -> Result<bool> {
        if header.log_guid.is_nil() {
            return Ok(false);
        }
        let mut signature = [0u8; 4];
        match backend.read_at(header.log_offset, &mut signature) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(FormatError::Corrupt("log region truncated").into())
            }
            Err(e) => return Err(e),
        }
        if signature == LOG_ENTRY_SIGNATURE {
            return Err(DiskError::LogReplayRequired);
        }
        debug!(log_guid = %header.log_guid, "log guid set but log region holds no entries");
        Ok(false)
    }

    fn append(&mut self, _backend: &mut dyn StorageBackend, record: LogRecord) -> Result<()> {
        self.pending.push_back(record);
        Ok(())
    }

    fn flush(&mut self, backend: &mut dyn StorageBackend) -> Result<()> {
        while let Some(record) = self.pending.front() {
            backend.write_at(record.file_offset, &record.data)?;
            self.pending.pop_front();
        }
        backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::MIB;
    use crate::MemBackend;
    use uuid::Uuid;

    fn header(log_guid: Uuid) -> VhdxHeader {
        VhdxHeader {
            sequence_number: 1,
            file_write_guid: Uuid::from_u128(1),
            data_write_guid: Uuid::from_u128(2),
            log_guid,
            log_version: 0,
            version: 1,
            log_length: MIB as u32,
            log_offset: MIB,
        }
    }

    #[test]
    fn nil_log_guid_means_nothing_to_replay() {
        let mut backend = MemBackend::new();
        let mut log = DirectLog::new();
        assert!(!log.replay(&mut backend, &header(Uuid::nil()), false).unwrap());
    }

    #[test]
    fn pending_entries_require_real_replay() {
        let mut backend = MemBackend::with_len(2 * MIB).unwrap();
        let mut log = DirectLog::new();
        let h = header(Uuid::from_u128(7));
        assert!(!log.replay(&mut backend, &h, false).unwrap());

        backend.write_at(MIB, &LOG_ENTRY_SIGNATURE).unwrap();
        assert!(matches!(
            log.replay(&mut backend, &h, true).unwrap_err(),
            DiskError::LogReplayRequired
        ));
    }

    #[test]
    fn truncated_log_region_is_corrupt() {
        let mut backend = MemBackend::with_len(MIB).unwrap();
        let mut log = DirectLog::new();
        assert!(matches!(
            log.replay(&mut backend, &header(Uuid::from_u128(7)), false)
                .unwrap_err(),
            DiskError::Format(FormatError::Corrupt(_))
        ));
    }

    #[test]
    fn records_land_on_flush() {
        let mut backend = MemBackend::with_len(64).unwrap();
        let mut log = DirectLog::new();
        log.append(
            &mut backend,
            LogRecord {
                file_offset: 8,
                data: vec![0xAA; 8],
            },
        )
        .unwrap();
        assert_eq!(&backend.as_slice()[8..16], &[0; 8]);
        log.flush(&mut backend).unwrap();
        assert_eq!(&backend.as_slice()[8..16], &[0xAA; 8]);
    }

    struct FailAt {
        inner: MemBackend,
        offset: Option<u64>,
    }

    impl StorageBackend for FailAt {
        fn len(&mut self) -> Result<u64> {
            self.inner.len()
        }

        fn set_len(&mut self, len: u64) -> Result<()> {
            self.inner.set_len(len)
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_at(offset, buf)
        }

        fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
            if self.offset == Some(offset) {
                return Err(DiskError::Io("injected".to_string()));
            }
            self.inner.write_at(offset, buf)
        }

        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn failed_flush_keeps_unwritten_records_queued() {
        let mut backend = FailAt {
            inner: MemBackend::with_len(64).unwrap(),
            offset: Some(16),
        };
        let mut log = DirectLog::new();
        for (offset, byte) in [(0, 0x11u8), (16, 0x22), (32, 0x33)] {
            log.append(
                &mut backend,
                LogRecord {
                    file_offset: offset,
                    data: vec![byte; 8],
                },
            )
            .unwrap();
        }

        assert!(matches!(
            log.flush(&mut backend).unwrap_err(),
            DiskError::Io(_)
        ));
        assert_eq!(&backend.inner.as_slice()[0..8], &[0x11; 8]);
        assert_eq!(&backend.inner.as_slice()[32..40], &[0; 8]);
        assert_eq!(log.pending.len(), 2);

        backend.offset = None;
        log.flush(&mut backend).unwrap();
        assert!(log.pending.is_empty());
        assert_eq!(&backend.inner.as_slice()[16..24], &[0x22; 8]);
        assert_eq!(&backend.inner.as_slice()[32..40], &[0x33; 8]);
    }
}

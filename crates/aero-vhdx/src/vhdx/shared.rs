use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use super::check::{CheckMode, CheckReport};
use super::image::{execute_read, ImageInfo, ImageState};
use crate::{DiskError, Result, StorageBackend};

struct SharedInner<B> {
    capacity: u64,
    /// Headers, BAT and session flags. Held for translation and metadata updates, never for a
    /// payload transfer.
    state: AsyncMutex<ImageState>,
    /// Held only for the duration of a single backend call sequence.
    backend: Mutex<B>,
}

/// A cloneable handle to one open image for concurrent async callers.
///
/// Requests on the same image interleave at payload-transfer boundaries: translation,
/// allocation and BAT updates run one at a time under the state lock, and the state lock is
/// released while guest data moves to or from the backend.
pub struct SharedVhdxDisk<B> {
    inner: Arc<SharedInner<B>>,
}

impl<B> Clone for SharedVhdxDisk<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: StorageBackend> SharedVhdxDisk<B> {
    pub(crate) fn new(backend: B, state: ImageState) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                capacity: state.capacity(),
                state: AsyncMutex::new(state),
                backend: Mutex::new(backend),
            }),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.capacity
    }

    fn backend(&self) -> Result<MutexGuard<'_, B>> {
        self.inner
            .backend
            .lock()
            .map_err(|_| DiskError::Io("poisoned lock".to_string()))
    }

    pub async fn info(&self) -> ImageInfo {
        self.inner.state.lock().await.info()
    }

    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let chunks = {
            let state = self.inner.state.lock().await;
            state.map_read(offset, buf.len())?
        };
        let mut backend = self.backend()?;
        execute_read(&mut *backend, &chunks, buf)
    }

    pub async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.check_writable()?;
            state.check_range(offset, buf.len())?;
            if buf.is_empty() {
                return Ok(());
            }
            let mut backend = self.backend()?;
            state.user_visible_write(&mut *backend)?;
        }

        let mut done = 0usize;
        while done < buf.len() {
            let plan = {
                let mut state = self.inner.state.lock().await;
                let mut backend = self.backend()?;
                state.prepare_write(&mut *backend, offset + done as u64, (buf.len() - done) as u64)?
            };

            let chunk = &buf[done..done + plan.len];
            let res = self
                .backend()
                .and_then(|mut backend| backend.write_at(plan.file_offset, chunk));
            if let Err(err) = res {
                if let Some(undo) = plan.undo {
                    let mut state = self.inner.state.lock().await;
                    match self.backend() {
                        Ok(mut backend) => state.rollback(&mut *backend, undo),
                        Err(lock_err) => {
                            warn!(%lock_err, "backend unavailable, restoring bat entry in memory only");
                            state.restore_entry(undo);
                        }
                    }
                }
                return Err(err);
            }
            done += plan.len;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.read_only {
            return Ok(());
        }
        let mut backend = self.backend()?;
        state.flush(&mut *backend)
    }

    pub async fn check(&self, mode: CheckMode) -> Result<CheckReport> {
        let state = self.inner.state.lock().await;
        let mut backend = self.backend()?;
        state.check(&mut *backend, mode)
    }

    /// Flush and hand back the backend. Fails if other handles to the image are still alive.
    pub async fn close(self) -> Result<B> {
        let inner = Arc::try_unwrap(self.inner)
            .map_err(|_| DiskError::InvalidConfig("image still has other open handles"))?;
        let mut state = inner.state.into_inner();
        let mut backend = inner
            .backend
            .into_inner()
            .map_err(|_| DiskError::Io("poisoned lock".to_string()))?;
        if !state.read_only {
            state.flush(&mut backend)?;
        }
        Ok(backend)
    }
}

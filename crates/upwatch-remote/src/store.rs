//! ---
//! upw_section: "05-networking-external-interfaces"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Remote state store contract and in-memory record."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use upwatch_common::{ServiceDiff, UpdatableServicesMap};

use crate::error::{RemoteError, Result};

/// Read and partial-write access to the `updatable_services` field.
#[async_trait]
pub trait RemoteStateStore: Send + Sync {
    /// Current value of the field. A record without the field reads as empty.
    async fn read_updatable_services(&self) -> Result<UpdatableServicesMap>;

    /// Apply `diff` key by key. Other keys and other fields are untouched, and
    /// applying the same diff twice leaves the same state.
    async fn write_updatable_services(&self, diff: &ServiceDiff) -> Result<()>;

    /// Overwrite the whole field with `map`.
    async fn replace_updatable_services(&self, map: &UpdatableServicesMap) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    record: Mutex<Option<UpdatableServicesMap>>,
    write_log: Mutex<Vec<ServiceDiff>>,
    reads: AtomicUsize,
    write_attempts: AtomicUsize,
    writes: AtomicUsize,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
    rejecting_writes: AtomicU32,
}

/// In-process device record. Backs `remote.backend = "memory"` and the tests.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<MemoryState>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// A record that exists with an empty `updatable_services` field.
    pub fn new() -> Self {
        Self::with_entries(UpdatableServicesMap::new())
    }

    /// A record already holding `entries`.
    pub fn with_entries(entries: UpdatableServicesMap) -> Self {
        let state = MemoryState {
            record: Mutex::new(Some(entries)),
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// No record at all; reads fail with [`RemoteError::RecordNotFound`]
    /// until the first write creates it.
    pub fn missing() -> Self {
        Self {
            state: Arc::new(MemoryState::default()),
        }
    }

    /// Current field value, `None` while the record does not exist.
    pub fn snapshot(&self) -> Option<UpdatableServicesMap> {
        self.state.record.lock().clone()
    }

    /// Set one key as another writer would.
    pub fn set_entry(&self, service: impl Into<String>, version: impl Into<String>) {
        self.state
            .record
            .lock()
            .get_or_insert_with(UpdatableServicesMap::new)
            .insert(service.into(), version.into());
    }

    /// Make the next `count` reads fail as unreachable.
    pub fn fail_next_reads(&self, count: u32) {
        self.state.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail as unreachable.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail as rejected by the store (HTTP 400).
    pub fn reject_next_writes(&self, count: u32) {
        self.state.rejecting_writes.store(count, Ordering::SeqCst);
    }

    /// Reads attempted so far.
    pub fn reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    /// Writes attempted so far, failed ones included.
    pub fn write_attempts(&self) -> usize {
        self.state.write_attempts.load(Ordering::SeqCst)
    }

    /// Writes that were applied.
    pub fn writes(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    /// Every applied diff, oldest first.
    pub fn write_log(&self) -> Vec<ServiceDiff> {
        self.state.write_log.lock().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn injected_write_failure(&self) -> Option<RemoteError> {
        if Self::take_failure(&self.state.failing_writes) {
            return Some(RemoteError::Unreachable("injected write failure".into()));
        }
        if Self::take_failure(&self.state.rejecting_writes) {
            return Some(RemoteError::WriteRejected {
                status: 400,
                body: "injected write rejection".into(),
            });
        }
        None
    }
}

#[async_trait]
impl RemoteStateStore for MemoryRemote {
    async fn read_updatable_services(&self) -> Result<UpdatableServicesMap> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.state.failing_reads) {
            return Err(RemoteError::Unreachable("injected read failure".into()));
        }
        self.state
            .record
            .lock()
            .clone()
            .ok_or_else(|| RemoteError::RecordNotFound("memory".into()))
    }

    async fn write_updatable_services(&self, diff: &ServiceDiff) -> Result<()> {
        self.state.write_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.injected_write_failure() {
            return Err(err);
        }
        {
            let mut record = self.state.record.lock();
            diff.apply_to(record.get_or_insert_with(UpdatableServicesMap::new));
        }
        self.state.write_log.lock().push(diff.clone());
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        debug!(
            upserts = diff.upsert_count(),
            removals = diff.removal_count(),
            "memory record updated"
        );
        Ok(())
    }

    async fn replace_updatable_services(&self, map: &UpdatableServicesMap) -> Result<()> {
        self.state.write_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.injected_write_failure() {
            return Err(err);
        }
        *self.state.record.lock() = Some(map.clone());
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn diff_only_touches_named_keys() {
        let remote = MemoryRemote::new();
        remote.set_entry("other-writer", "9.9.9");

        let diff = ServiceDiff::default().upsert("button-handler", "0.1.1");
        remote.write_updatable_services(&diff).await.unwrap();
        remote.write_updatable_services(&diff).await.unwrap();

        let map = remote.read_updatable_services().await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("other-writer").map(String::as_str), Some("9.9.9"));
        assert_eq!(remote.writes(), 2);
    }

    #[tokio::test]
    async fn missing_record_is_created_by_first_write() {
        let remote = MemoryRemote::missing();
        assert!(matches!(
            remote.read_updatable_services().await,
            Err(RemoteError::RecordNotFound(_))
        ));
        remote
            .write_updatable_services(&ServiceDiff::default().upsert("a", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(remote.snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let remote = MemoryRemote::new();
        remote.fail_next_writes(1);
        let diff = ServiceDiff::default().upsert("a", "1.0.0");
        assert!(remote.write_updatable_services(&diff).await.is_err());
        assert!(remote.write_updatable_services(&diff).await.is_ok());
        assert_eq!(remote.write_attempts(), 2);
        assert_eq!(remote.writes(), 1);
    }

    #[tokio::test]
    async fn rejected_write_leaves_record_untouched() {
        let remote = MemoryRemote::new();
        remote.reject_next_writes(1);
        let diff = ServiceDiff::default().upsert("a", "1.0.0");
        assert!(matches!(
            remote.write_updatable_services(&diff).await,
            Err(RemoteError::WriteRejected { status: 400, .. })
        ));
        assert_eq!(remote.snapshot(), Some(UpdatableServicesMap::new()));
        assert_eq!(remote.writes(), 0);
    }

    #[tokio::test]
    async fn replace_overwrites_whole_field() {
        let remote = MemoryRemote::new();
        remote.set_entry("stale", "1.0.0");
        let mut map = UpdatableServicesMap::new();
        map.insert("fresh".into(), "2.0.0".into());
        remote.replace_updatable_services(&map).await.unwrap();
        assert_eq!(remote.snapshot(), Some(map));
    }
}

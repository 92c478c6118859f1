//! Shared pipeline status, exposed read-only to the dashboard collaborator.
//!
//! Workers bump atomic counters as files and events move through the
//! pipeline; `snapshot()` assembles a consistent-enough view for polling.
//! Only the ResourceMonitor writes the resource reading.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use crate::models::ResourceSnapshot;

/// Coarse pipeline state for external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Planning,
    Fetching,
    Processing,
    Ingesting,
    Reconciling,
    Paused,
}

#[derive(Default)]
pub struct PipelineStatus {
    state: Mutex<Option<PipelineState>>,
    queued_files: AtomicUsize,
    in_flight_files: AtomicUsize,
    files_complete: AtomicU64,
    files_incomplete: AtomicU64,
    files_unchanged: AtomicU64,
    files_failed: AtomicU64,
    permanent_gaps: AtomicU64,
    events_ingested: AtomicU64,
    duplicate_events: AtomicU64,
    rejected_records: AtomicU64,
    errors: AtomicU64,
    resource: RwLock<ResourceSnapshot>,
}

/// Point-in-time view of [`PipelineStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: PipelineState,
    pub queued_files: usize,
    pub in_flight_files: usize,
    pub files_complete: u64,
    pub files_incomplete: u64,
    pub files_unchanged: u64,
    pub files_failed: u64,
    pub permanent_gaps: u64,
    pub events_ingested: u64,
    pub duplicate_events: u64,
    pub rejected_records: u64,
    pub errors: u64,
    pub resource: ResourceSnapshot,
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: PipelineState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = Some(state);
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .unwrap_or(PipelineState::Idle)
    }

    pub fn set_queued(&self, n: usize) {
        self.queued_files.store(n, Ordering::Relaxed);
    }

    pub fn file_started(&self) {
        self.in_flight_files.fetch_add(1, Ordering::Relaxed);
        let queued = self.queued_files.load(Ordering::Relaxed);
        if queued > 0 {
            self.queued_files.store(queued - 1, Ordering::Relaxed);
        }
    }

    pub fn file_finished(&self) {
        self.in_flight_files.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight_files.load(Ordering::Relaxed)
    }

    pub fn add_complete(&self) {
        self.files_complete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_incomplete(&self) {
        self.files_incomplete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unchanged(&self) {
        self.files_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_permanent_gap(&self) {
        self.permanent_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events(&self, ingested: u64, duplicates: u64, rejected: u64) {
        self.events_ingested.fetch_add(ingested, Ordering::Relaxed);
        self.duplicate_events
            .fetch_add(duplicates, Ordering::Relaxed);
        self.rejected_records.fetch_add(rejected, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_ingested(&self) -> u64 {
        self.events_ingested.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn set_resource(&self, snapshot: ResourceSnapshot) {
        if let Ok(mut guard) = self.resource.write() {
            *guard = snapshot;
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let resource = self
            .resource
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        StatusSnapshot {
            state: self.state(),
            queued_files: self.queued_files.load(Ordering::Relaxed),
            in_flight_files: self.in_flight_files.load(Ordering::Relaxed),
            files_complete: self.files_complete.load(Ordering::Relaxed),
            files_incomplete: self.files_incomplete.load(Ordering::Relaxed),
            files_unchanged: self.files_unchanged.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            permanent_gaps: self.permanent_gaps.load(Ordering::Relaxed),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            rejected_records: self.rejected_records.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            resource,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_roll_up_into_snapshot() {
        let status = PipelineStatus::new();
        status.set_state(PipelineState::Fetching);
        status.set_queued(3);
        status.file_started();
        status.add_events(100, 2, 1);
        status.add_complete();
        status.add_error();
        status.file_finished();

        let snap = status.snapshot();
        assert_eq!(snap.state, PipelineState::Fetching);
        assert_eq!(snap.queued_files, 2);
        assert_eq!(snap.in_flight_files, 0);
        assert_eq!(snap.files_complete, 1);
        assert_eq!(snap.events_ingested, 100);
        assert_eq!(snap.duplicate_events, 2);
        assert_eq!(snap.rejected_records, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn default_state_is_idle() {
        let status = PipelineStatus::new();
        assert_eq!(status.state(), PipelineState::Idle);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Per-subject tracking stops growing past this many subjects.
const MAX_TRACKED_SUBJECTS: usize = 10_000;

/// Things the admission layer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionEvent {
    Admitted,
    Throttled,
    Replayed,
    /// Admitted without consulting the shared store (fail-open).
    DegradedAdmission,
    StoreFailure,
    BackendError,
    CorruptRecord,
    DuplicateInFlight,
    DeadlineExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionMetrics {
    pub total_requests: u64,
    pub admitted_requests: u64,
    pub throttled_requests: u64,
    pub replayed_responses: u64,
    pub degraded_admissions: u64,
    pub store_failures: u64,
    pub backend_errors: u64,
    pub corrupt_records: u64,
    pub duplicate_in_flight: u64,
    pub deadline_exceeded: u64,
    pub last_reset: u64,
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            admitted_requests: 0,
            throttled_requests: 0,
            replayed_responses: 0,
            degraded_admissions: 0,
            store_failures: 0,
            backend_errors: 0,
            corrupt_records: 0,
            duplicate_in_flight: 0,
            deadline_exceeded: 0,
            last_reset: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

impl AdmissionMetrics {
    fn apply(&mut self, event: AdmissionEvent) {
        match event {
            AdmissionEvent::Admitted => {
                self.total_requests += 1;
                self.admitted_requests += 1;
            }
            AdmissionEvent::Throttled => {
                self.total_requests += 1;
                self.throttled_requests += 1;
            }
            AdmissionEvent::Replayed => {
                self.total_requests += 1;
                self.replayed_responses += 1;
            }
            AdmissionEvent::DegradedAdmission => self.degraded_admissions += 1,
            AdmissionEvent::StoreFailure => self.store_failures += 1,
            AdmissionEvent::BackendError => self.backend_errors += 1,
            AdmissionEvent::CorruptRecord => self.corrupt_records += 1,
            AdmissionEvent::DuplicateInFlight => self.duplicate_in_flight += 1,
            AdmissionEvent::DeadlineExceeded => self.deadline_exceeded += 1,
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    global: AdmissionMetrics,
    subjects: HashMap<String, AdmissionMetrics>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    state: Arc<RwLock<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, subject: Option<&str>, event: AdmissionEvent) {
        let mut state = self.state.write().await;
        state.global.apply(event);

        if let Some(subject) = subject {
            if state.subjects.len() < MAX_TRACKED_SUBJECTS || state.subjects.contains_key(subject) {
                state
                    .subjects
                    .entry(subject.to_string())
                    .or_default()
                    .apply(event);
            }
        }
    }

    pub async fn get_subject_metrics(&self, subject: &str) -> Option<AdmissionMetrics> {
        let state = self.state.read().await;
        state.subjects.get(subject).cloned()
    }

    pub async fn get_global_metrics(&self) -> AdmissionMetrics {
        self.state.read().await.global.clone()
    }

    pub async fn tracked_subjects(&self) -> usize {
        self.state.read().await.subjects.len()
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = MetricsState::default();
    }
}

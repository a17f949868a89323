//! Run reporting: per-identifier events and the end-of-run summary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::FailureKind;

/// What happened to a record's full text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FulltextOutcome {
    /// Not requested, or the record has no PMC id
    #[default]
    NotAttempted,
    Stored,
    /// Fetch or storage failed; the record itself is still completed
    Failed,
}

/// Progress notifications sent while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    Completed {
        identifier: String,
        document_id: i64,
        created: bool,
        references_resolved: u64,
        reference_stubs: u64,
        stubs_backfilled: u64,
        fulltext: FulltextOutcome,
    },
    Failed {
        identifier: String,
        kind: FailureKind,
        error: String,
    },
    /// Offered again after completing in an earlier run
    Skipped { identifier: String },
    BatchCommitted {
        batch: u64,
        size: usize,
        completed: u64,
        failed: u64,
    },
    RunFinished { stats: RunStats },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub malformed: u64,
    /// Identifiers moved back to pending at run start
    pub recovered: u64,
    pub batches: u64,
    pub references_resolved: u64,
    pub reference_stubs: u64,
    pub stubs_backfilled: u64,
    pub fulltext_stored: u64,
    pub fulltext_failed: u64,
    pub conflicts: u64,
    pub cancelled: bool,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
}

impl RunStats {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            malformed: 0,
            recovered: 0,
            batches: 0,
            references_resolved: 0,
            reference_stubs: 0,
            stubs_backfilled: 0,
            fulltext_stored: 0,
            fulltext_failed: 0,
            conflicts: 0,
            cancelled: false,
            failures_by_kind: BTreeMap::new(),
        }
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        self.processed += 1;
        self.failed += 1;
        if kind == FailureKind::MalformedRecord {
            self.malformed += 1;
        }
        *self.failures_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn record_fulltext(&mut self, outcome: FulltextOutcome) {
        match outcome {
            FulltextOutcome::Stored => self.fulltext_stored += 1,
            FulltextOutcome::Failed => self.fulltext_failed += 1,
            FulltextOutcome::NotAttempted => {}
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_accounting() {
        let mut stats = RunStats::start();
        stats.record_failure(FailureKind::MalformedRecord);
        stats.record_failure(FailureKind::TransientFetch);
        stats.record_failure(FailureKind::TransientFetch);

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.failures_by_kind[&FailureKind::TransientFetch], 2);
        assert_eq!(stats.duration_secs(), None);

        stats.finish();
        assert!(stats.duration_secs().unwrap() >= 0.0);
    }

    #[test]
    fn test_events_are_tagged() {
        let event = IngestEvent::Skipped {
            identifier: "42".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "skipped");
        assert_eq!(json["identifier"], "42");

        let mut stats = RunStats::start();
        stats.record_fulltext(FulltextOutcome::Stored);
        stats.record_fulltext(FulltextOutcome::NotAttempted);
        assert_eq!((stats.fulltext_stored, stats.fulltext_failed), (1, 0));
        assert_eq!(serde_json::to_value(FulltextOutcome::NotAttempted).unwrap(), "not_attempted");

        let stats = serde_json::to_value(stats).unwrap();
        assert_eq!(stats["cancelled"], false);
        assert!(stats["run_id"].is_string());
    }
}

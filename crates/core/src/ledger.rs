//! Per-document extraction state.
//!
//! `LedgerBook` holds the transition rules; the backends in `stores` wrap it
//! in a lock so that a claim is a single check-and-set.

use crate::models::{IngestionRecord, IngestionStatus, PipelineConfig};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub stale_after: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl LedgerPolicy {
    fn stale(&self, record: &IngestionRecord, now: DateTime<Utc>) -> bool {
        record
            .last_attempt_at
            .map_or(true, |attempted| now - attempted >= self.stale_after)
    }

    fn retry_eligible(&self, record: &IngestionRecord, now: DateTime<Utc>) -> bool {
        if record.attempts >= self.max_attempts {
            return false;
        }
        record
            .last_attempt_at
            .map_or(true, |attempted| now - attempted >= self.retry_backoff)
    }
}

impl From<&PipelineConfig> for LedgerPolicy {
    fn from(config: &PipelineConfig) -> Self {
        let span = |value: std::time::Duration| {
            Duration::from_std(value).unwrap_or(Duration::MAX)
        };
        Self {
            stale_after: span(config.stale_after),
            max_attempts: config.max_attempts,
            retry_backoff: span(config.retry_backoff),
        }
    }
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Documents a pass should work on, plus the ones another run holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingListing {
    pub pending: Vec<String>,
    pub in_flight: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    /// Someone else holds the document, or it is not pending.
    Conflict(IngestionStatus),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerBook {
    records: BTreeMap<String, IngestionRecord>,
}

impl LedgerBook {
    pub fn from_records(records: impl IntoIterator<Item = IngestionRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.doc_name.clone(), record))
                .collect(),
        }
    }

    pub fn records(&self) -> Vec<IngestionRecord> {
        self.records.values().cloned().collect()
    }

    pub fn get(&self, doc_name: &str) -> Option<&IngestionRecord> {
        self.records.get(doc_name)
    }

    /// Registers unseen documents, moves retry-eligible failures and abandoned
    /// claims back to pending, and reports what is pending. Returns `true` in
    /// the second slot when any record changed.
    pub fn list_pending(
        &mut self,
        present: &[String],
        now: DateTime<Utc>,
        policy: &LedgerPolicy,
    ) -> (PendingListing, bool) {
        let mut listing = PendingListing::default();
        let mut changed = false;

        let mut names = present.to_vec();
        names.sort_unstable();
        names.dedup();

        for doc_name in names {
            if !self.records.contains_key(&doc_name) {
                self.records
                    .insert(doc_name.clone(), IngestionRecord::pending(doc_name.clone()));
                changed = true;
                listing.pending.push(doc_name);
                continue;
            }
            let Some(record) = self.records.get_mut(&doc_name) else {
                continue;
            };

            match record.status {
                IngestionStatus::Pending => listing.pending.push(doc_name),
                IngestionStatus::Complete => {}
                IngestionStatus::InProgress if policy.stale(record, now) => {
                    warn!(doc_name = %doc_name, "reclaiming abandoned extraction");
                    record.status = IngestionStatus::Pending;
                    changed = true;
                    listing.pending.push(doc_name);
                }
                IngestionStatus::InProgress => listing.in_flight.push(doc_name),
                IngestionStatus::Failed if policy.retry_eligible(record, now) => {
                    info!(
                        doc_name = %doc_name,
                        attempts = record.attempts,
                        "retrying failed document"
                    );
                    record.status = IngestionStatus::Pending;
                    changed = true;
                    listing.pending.push(doc_name);
                }
                IngestionStatus::Failed => {}
            }
        }

        (listing, changed)
    }

    /// Check-and-set: only a pending (or abandoned) record can be claimed.
    pub fn claim(&mut self, doc_name: &str, now: DateTime<Utc>, policy: &LedgerPolicy) -> Claim {
        let record = self
            .records
            .entry(doc_name.to_string())
            .or_insert_with(|| IngestionRecord::pending(doc_name));

        let claimable = match record.status {
            IngestionStatus::Pending => true,
            IngestionStatus::InProgress => policy.stale(record, now),
            IngestionStatus::Complete | IngestionStatus::Failed => false,
        };
        if !claimable {
            return Claim::Conflict(record.status);
        }

        record.status = IngestionStatus::InProgress;
        record.last_attempt_at = Some(now);
        record.attempts = record.attempts.saturating_add(1);
        Claim::Claimed
    }

    pub fn complete(&mut self, doc_name: &str, chunk_count: usize, now: DateTime<Utc>) {
        let record = self.settle(doc_name);
        record.status = IngestionStatus::Complete;
        record.chunk_count = chunk_count;
        record.last_attempt_at = Some(now);
        record.error_detail = None;
    }

    pub fn fail(&mut self, doc_name: &str, error_detail: &str, now: DateTime<Utc>) {
        let record = self.settle(doc_name);
        record.status = IngestionStatus::Failed;
        record.last_attempt_at = Some(now);
        record.error_detail = Some(error_detail.to_string());
    }

    fn settle(&mut self, doc_name: &str) -> &mut IngestionRecord {
        let record = self
            .records
            .entry(doc_name.to_string())
            .or_insert_with(|| IngestionRecord::pending(doc_name));
        if record.status != IngestionStatus::InProgress {
            warn!(doc_name, status = %record.status, "settling a document that was not claimed");
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn policy() -> LedgerPolicy {
        LedgerPolicy {
            stale_after: Duration::minutes(30),
            max_attempts: 2,
            retry_backoff: Duration::minutes(5),
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn unseen_documents_become_pending() {
        let mut book = LedgerBook::default();
        let present = names(&["b.pdf", "a.pdf", "a.pdf"]);
        let (listing, changed) = book.list_pending(&present, start(), &policy());

        assert!(changed);
        assert_eq!(listing.pending, names(&["a.pdf", "b.pdf"]));
        assert_eq!(book.records().len(), 2);
    }

    #[test]
    fn second_claim_conflicts() {
        let mut book = LedgerBook::default();
        book.list_pending(&names(&["a.pdf"]), start(), &policy());

        assert_eq!(book.claim("a.pdf", start(), &policy()), Claim::Claimed);
        assert_eq!(
            book.claim("a.pdf", start(), &policy()),
            Claim::Conflict(IngestionStatus::InProgress)
        );
    }

    #[test]
    fn complete_documents_are_not_listed_again() {
        let mut book = LedgerBook::default();
        book.list_pending(&names(&["a.pdf"]), start(), &policy());
        book.claim("a.pdf", start(), &policy());
        book.complete("a.pdf", 12, start());

        let before = book.clone();
        let (listing, changed) = book.list_pending(&names(&["a.pdf"]), start(), &policy());

        assert!(!changed);
        assert!(listing.pending.is_empty());
        assert_eq!(book, before);
        assert_eq!(book.get("a.pdf").map(|record| record.chunk_count), Some(12));
    }

    #[test]
    fn failures_retry_after_backoff_until_attempts_run_out() {
        let mut book = LedgerBook::default();
        book.list_pending(&names(&["a.pdf"]), start(), &policy());
        book.claim("a.pdf", start(), &policy());
        book.fail("a.pdf", "unreadable", start());

        let present = names(&["a.pdf"]);
        let (too_soon, _) = book.list_pending(&present, start() + Duration::minutes(1), &policy());
        assert!(too_soon.pending.is_empty());

        let later = start() + Duration::minutes(10);
        let (retry, changed) = book.list_pending(&present, later, &policy());
        assert!(changed);
        assert_eq!(retry.pending, names(&["a.pdf"]));

        book.claim("a.pdf", later, &policy());
        book.fail("a.pdf", "unreadable again", later);

        let record = book.get("a.pdf").cloned().expect("record exists");
        assert!(record.is_permanently_failed(2));
        assert_eq!(record.error_detail.as_deref(), Some("unreadable again"));

        let (exhausted, _) = book.list_pending(&present, later + Duration::hours(1), &policy());
        assert!(exhausted.pending.is_empty());
    }

    #[test]
    fn abandoned_claims_are_reclaimed_after_staleness_threshold() {
        let mut book = LedgerBook::default();
        book.list_pending(&names(&["a.pdf"]), start(), &policy());
        book.claim("a.pdf", start(), &policy());

        let present = names(&["a.pdf"]);
        let (fresh, _) = book.list_pending(&present, start() + Duration::minutes(10), &policy());
        assert_eq!(fresh.in_flight, names(&["a.pdf"]));
        assert!(fresh.pending.is_empty());

        let (stale, changed) = book.list_pending(&present, start() + Duration::minutes(31), &policy());
        assert!(changed);
        assert_eq!(stale.pending, names(&["a.pdf"]));
    }
}

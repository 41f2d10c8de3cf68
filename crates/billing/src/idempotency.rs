//! Event deduplication
//!
//! At-most-once effects for at-least-once delivery. A provider event id is
//! admitted once, through an insert-if-absent on the processed-event row.
//! Rows are never deleted. A failed row is only handed out again when the
//! failure was transient, which means no effect was committed. A `processing`
//! claim holds for one lease; a delivery arriving inside it is told to retry,
//! and one arriving after it takes the event over.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::store::{ClaimResult, EventOutcome, ProcessedEvent, ProcessedEventStore};
use crate::webhooks::DEFAULT_WEBHOOK_DEADLINE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Caller owns the event and must record an outcome
    Admitted,
    /// Already handled; acknowledge without effects
    AlreadyProcessed(EventOutcome),
}

pub struct EventDeduplicator {
    store: Arc<dyn ProcessedEventStore>,
    lease: Duration,
}

impl EventDeduplicator {
    pub fn new(store: Arc<dyn ProcessedEventStore>) -> Self {
        Self {
            store,
            lease: DEFAULT_WEBHOOK_DEADLINE,
        }
    }

    /// How long a `processing` claim holds before another delivery may take it
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Claim `event_id` at `now`.
    ///
    /// Returns `EventInProgress` (transient) while another delivery holds a
    /// live claim, so the provider redelivers instead of treating it as done.
    pub async fn admit(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Admission> {
        let existing = match self.store.try_claim_event(event_id, event_type, now).await? {
            ClaimResult::Claimed => return Ok(Admission::Admitted),
            ClaimResult::Exists(existing) => existing,
        };

        let stale_before = now - self.lease;
        let reclaimable = match existing.outcome {
            EventOutcome::Failed => existing.retryable,
            EventOutcome::Processing => existing.claimed_at < stale_before,
            EventOutcome::Applied | EventOutcome::Ignored => false,
        };

        if reclaimable {
            if self.store.reclaim_event(event_id, now, stale_before).await? {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    previous_outcome = %existing.outcome,
                    previous_error = ?existing.error_message,
                    "Reclaimed event"
                );
                return Ok(Admission::Admitted);
            }
            // Another delivery reclaimed it between our read and update
            return Err(BillingError::EventInProgress(event_id.to_string()));
        }

        if existing.outcome == EventOutcome::Processing {
            tracing::warn!(
                event_id = %event_id,
                event_type = %event_type,
                claimed_at = %existing.claimed_at,
                lease_secs = self.lease.as_secs(),
                "Event claimed by another delivery, asking for redelivery"
            );
            return Err(BillingError::EventInProgress(event_id.to_string()));
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            outcome = %existing.outcome,
            "Event already processed, skipping"
        );
        Ok(Admission::AlreadyProcessed(existing.outcome))
    }

    pub async fn mark_applied(&self, event_id: &str) -> BillingResult<()> {
        self.store
            .record_outcome(event_id, EventOutcome::Applied, None, false)
            .await
    }

    pub async fn mark_ignored(&self, event_id: &str, reason: &str) -> BillingResult<()> {
        self.store
            .record_outcome(event_id, EventOutcome::Ignored, Some(reason), false)
            .await
    }

    /// Record a failure. Transient errors leave the row reclaimable.
    pub async fn mark_failed(&self, event_id: &str, error: &BillingError) -> BillingResult<()> {
        let message = error.to_string();
        self.store
            .record_outcome(event_id, EventOutcome::Failed, Some(&message), error.is_transient())
            .await
    }

    pub async fn list(&self, outcome: Option<EventOutcome>, limit: i64) -> BillingResult<Vec<ProcessedEvent>> {
        self.store.list_events(outcome, limit.clamp(1, 500)).await
    }

    pub async fn get(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        self.store.get_event(event_id).await
    }
}

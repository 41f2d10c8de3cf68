//! In-memory store
//!
//! Backs the test suite and local runs without Postgres. Each trait method
//! takes a single lock for its whole body, which gives the same atomicity as
//! the conditional SQL statements in `PgStore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use accrue_shared::ResourceType;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    ClaimResult, EventOutcome, IncrementOutcome, ProcessedEvent, ProcessedEventStore,
    SubscriptionRecord, SubscriptionStore, UsageCounter, UsageStore,
};
use crate::error::{BillingError, BillingResult};
use crate::tiers::Limit;

type UsageKey = (Uuid, ResourceType, String);

/// Cheap to clone; clones share state
#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<InMemoryStoreInner>,
}

#[derive(Default)]
struct InMemoryStoreInner {
    subscriptions: RwLock<HashMap<Uuid, SubscriptionRecord>>,
    events: RwLock<HashMap<String, ProcessedEvent>>,
    usage: RwLock<HashMap<UsageKey, UsageCounter>>,
    unavailable: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> BillingResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| BillingError::Internal("in-memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> BillingResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| BillingError::Internal("in-memory store lock poisoned".to_string()))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage: every call fails with a transient error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Seed or overwrite a record directly, bypassing version checks
    pub fn put_subscription(&self, record: SubscriptionRecord) -> BillingResult<()> {
        write(&self.inner.subscriptions)?.insert(record.user_id, record);
        Ok(())
    }

    /// Seed a usage counter directly
    pub fn put_counter(&self, counter: UsageCounter) -> BillingResult<()> {
        let key = (counter.user_id, counter.resource_type, counter.period_key.clone());
        write(&self.inner.usage)?.insert(key, counter);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_available()?;
        Ok(read(&self.inner.subscriptions)?.get(&user_id).cloned())
    }

    async fn create_subscription_if_absent(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        self.check_available()?;
        let mut subs = write(&self.inner.subscriptions)?;
        Ok(subs
            .entry(record.user_id)
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn compare_and_swap_subscription(
        &self,
        record: &SubscriptionRecord,
        expected_version: i64,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut subs = write(&self.inner.subscriptions)?;

        // Same constraint as the partial unique index in Postgres
        if let Some(customer_id) = &record.provider_customer_id {
            let taken = subs.values().any(|other| {
                other.user_id != record.user_id
                    && other.provider_customer_id.as_deref() == Some(customer_id.as_str())
            });
            if taken {
                return Err(BillingError::InvalidInput(format!(
                    "provider customer already linked to another user ({})",
                    customer_id
                )));
            }
        }

        match subs.get_mut(&record.user_id) {
            Some(current) if current.version == expected_version => {
                *current = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        self.check_available()?;
        Ok(read(&self.inner.subscriptions)?
            .values()
            .find(|r| r.provider_customer_id.as_deref() == Some(customer_id))
            .map(|r| r.user_id))
    }

    async fn list_provider_linked(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        self.check_available()?;
        let mut records: Vec<SubscriptionRecord> = read(&self.inner.subscriptions)?
            .values()
            .filter(|r| r.provider_subscription_id.is_some())
            .filter(|r| after.is_none_or(|cursor| r.user_id > cursor))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.user_id);
        records.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(records)
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryStore {
    async fn try_claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        received_at: OffsetDateTime,
    ) -> BillingResult<ClaimResult> {
        self.check_available()?;
        let mut events = write(&self.inner.events)?;

        if let Some(existing) = events.get(event_id) {
            return Ok(ClaimResult::Exists(existing.clone()));
        }

        events.insert(
            event_id.to_string(),
            ProcessedEvent {
                provider_event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                received_at,
                claimed_at: received_at,
                outcome: EventOutcome::Processing,
                retryable: false,
                error_message: None,
                completed_at: None,
            },
        );
        Ok(ClaimResult::Claimed)
    }

    async fn reclaim_event(
        &self,
        event_id: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut events = write(&self.inner.events)?;

        match events.get_mut(event_id) {
            Some(event)
                if (event.outcome == EventOutcome::Failed && event.retryable)
                    || (event.outcome == EventOutcome::Processing && event.claimed_at < stale_before) =>
            {
                event.outcome = EventOutcome::Processing;
                event.claimed_at = now;
                event.error_message = None;
                event.completed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
        retryable: bool,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut events = write(&self.inner.events)?;

        if let Some(event) = events.get_mut(event_id) {
            event.outcome = outcome;
            event.error_message = error_message.map(str::to_string);
            event.retryable = retryable;
            event.completed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        self.check_available()?;
        Ok(read(&self.inner.events)?.get(event_id).cloned())
    }

    async fn list_events(
        &self,
        outcome: Option<EventOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<ProcessedEvent>> {
        self.check_available()?;
        let mut events: Vec<ProcessedEvent> = read(&self.inner.events)?
            .values()
            .filter(|e| outcome.is_none_or(|o| e.outcome == o))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn try_increment(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        period_key: &str,
        amount: i64,
        limit: Limit,
    ) -> BillingResult<IncrementOutcome> {
        self.check_available()?;
        let mut usage = write(&self.inner.usage)?;
        let now = OffsetDateTime::now_utc();

        let counter = usage
            .entry((user_id, resource, period_key.to_string()))
            .or_insert_with(|| UsageCounter {
                user_id,
                resource_type: resource,
                period_key: period_key.to_string(),
                current: 0,
                limit_value: limit.as_option(),
                updated_at: now,
            });

        if !limit.allows(counter.current, amount) {
            return Ok(IncrementOutcome::Rejected {
                current: counter.current,
            });
        }

        counter.current += amount;
        counter.limit_value = limit.as_option();
        counter.updated_at = now;

        Ok(IncrementOutcome::Accepted {
            current: counter.current,
        })
    }

    async fn get_counter(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        period_key: &str,
    ) -> BillingResult<Option<UsageCounter>> {
        self.check_available()?;
        Ok(read(&self.inner.usage)?
            .get(&(user_id, resource, period_key.to_string()))
            .cloned())
    }
}

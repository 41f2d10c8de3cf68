//! Stripe webhook handling
//!
//! verify -> admit (dedup) -> apply one typed mutation -> record outcome.
//!
//! Each handled event maps to at most one conditional subscription write, so
//! a transient failure leaves nothing committed and the event can be retried
//! on redelivery. The only step after the write is the provider call that
//! closes a completed installment plan; if that fails the event is marked
//! failed permanently and left for a human.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSessionObject, EventPayload, InvoiceObject, ProviderEvent, SubscriptionObject,
};
use crate::idempotency::{Admission, EventDeduplicator};
use crate::mutations::{SubscriptionMutation, SubscriptionSnapshot};
use crate::provider::{ProviderClient, ProviderSubscription};
use crate::store::{EventOutcome, ProcessedEvent};
use crate::subscriptions::SubscriptionService;
use crate::verify::{VerificationError, WebhookVerifier};

/// Default processing deadline, below the provider's delivery timeout
pub const DEFAULT_WEBHOOK_DEADLINE: Duration = Duration::from_secs(8);

/// What happened to a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookOutcome {
    Applied,
    Ignored,
    /// Event id seen before; acknowledged without effects
    Duplicate,
}

enum Disposition {
    Applied,
    Ignored(String),
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    dedup: Arc<EventDeduplicator>,
    subscriptions: Arc<SubscriptionService>,
    provider: Option<Arc<dyn ProviderClient>>,
    config: StripeConfig,
    deadline: Duration,
}

impl WebhookHandler {
    pub fn new(
        config: StripeConfig,
        dedup: Arc<EventDeduplicator>,
        subscriptions: Arc<SubscriptionService>,
        provider: Option<Arc<dyn ProviderClient>>,
    ) -> Self {
        let verifier = WebhookVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs);
        Self {
            verifier,
            dedup,
            subscriptions,
            provider,
            config,
            deadline: DEFAULT_WEBHOOK_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Verify and decode a raw webhook body
    pub fn verify_event(&self, payload: &str, signature: &str) -> Result<ProviderEvent, VerificationError> {
        self.verifier.verify(payload, signature)
    }

    /// Handle a verified event. `Err` means the provider should redeliver.
    ///
    /// An event another delivery is still working on fails with the transient
    /// `EventInProgress`; its row is left to the owner.
    pub async fn handle_event(&self, event: &ProviderEvent) -> BillingResult<WebhookOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let admission = self
            .dedup
            .admit(&event.id, &event.event_type, OffsetDateTime::now_utc())
            .await?;
        if let Admission::AlreadyProcessed(_) = admission {
            return Ok(WebhookOutcome::Duplicate);
        }

        let result = match tokio::time::timeout(self.deadline, self.apply(event)).await {
            Ok(result) => result,
            Err(_) => {
                // The write may or may not have committed; never hand this event out again
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    deadline_secs = self.deadline.as_secs(),
                    "RECONCILIATION NEEDED: webhook processing exceeded deadline, effects unknown"
                );
                let unknown = BillingError::ReconciliationNeeded(format!(
                    "processing exceeded {}s deadline",
                    self.deadline.as_secs()
                ));
                self.record_failure(event, &unknown).await;
                return Err(BillingError::Timeout(format!(
                    "webhook {} exceeded {}s deadline",
                    event.id,
                    self.deadline.as_secs()
                )));
            }
        };

        match result {
            Ok(Disposition::Applied) => {
                if let Err(e) = self.dedup.mark_applied(&event.id).await {
                    tracing::error!(
                        event_id = %event.id,
                        error = %e,
                        "Effects applied but outcome not recorded"
                    );
                }
                tracing::info!(event_id = %event.id, event_type = %event.event_type, "Webhook event applied");
                Ok(WebhookOutcome::Applied)
            }
            Ok(Disposition::Ignored(reason)) => {
                if let Err(e) = self.dedup.mark_ignored(&event.id, &reason).await {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to record ignored outcome");
                }
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "Webhook event ignored"
                );
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Webhook processing failed, awaiting redelivery"
                    );
                } else {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "RECONCILIATION NEEDED: webhook processing failed permanently"
                    );
                }
                self.record_failure(event, &e).await;
                Err(e)
            }
        }
    }

    /// Processed events, most recent first
    pub async fn list_events(
        &self,
        outcome: Option<EventOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<ProcessedEvent>> {
        self.dedup.list(outcome, limit).await
    }

    async fn record_failure(&self, event: &ProviderEvent, error: &BillingError) {
        if let Err(e) = self.dedup.mark_failed(&event.id, error).await {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook failure"
            );
        }
    }

    async fn apply(&self, event: &ProviderEvent) -> BillingResult<Disposition> {
        match &event.payload {
            EventPayload::CheckoutCompleted(session) => self.handle_checkout_completed(session).await,
            EventPayload::SubscriptionChanged(sub) => self.handle_subscription_changed(sub).await,
            EventPayload::SubscriptionDeleted(sub) => self.handle_subscription_deleted(sub).await,
            EventPayload::PaymentSucceeded(invoice) => {
                self.handle_payment_succeeded(invoice, event.created_at()).await
            }
            EventPayload::PaymentFailed(invoice) => {
                self.handle_payment_failed(invoice, event.created_at()).await
            }
            EventPayload::Unhandled => Ok(Disposition::Ignored(format!(
                "unhandled event type {}",
                event.event_type
            ))),
        }
    }

    async fn handle_checkout_completed(&self, session: &CheckoutSessionObject) -> BillingResult<Disposition> {
        let Some(customer_id) = session.customer_id() else {
            return Ok(Disposition::Ignored("checkout session has no customer".to_string()));
        };

        let user_id = self.resolve_user(session.user_id_hint(), Some(customer_id)).await?;

        let mutation = SubscriptionMutation::CheckoutCompleted {
            customer_id: customer_id.to_string(),
            subscription_id: session.subscription_id().map(str::to_string),
        };
        let applied = self.subscriptions.apply_event(user_id, &mutation, None).await?;

        Ok(if applied.changed {
            Disposition::Applied
        } else {
            Disposition::Ignored("customer already linked".to_string())
        })
    }

    async fn handle_subscription_changed(&self, sub: &SubscriptionObject) -> BillingResult<Disposition> {
        let user_id = self.resolve_user(sub.user_id_hint(), Some(sub.customer.id())).await?;

        let mutation = if sub.status.is_ended() {
            SubscriptionMutation::SubscriptionEnded {
                subscription_id: sub.id.clone(),
            }
        } else if sub.status.grants_tier() {
            let snapshot = SubscriptionSnapshot::from_provider(&ProviderSubscription::from(sub), &self.config)?;
            SubscriptionMutation::TierChanged(snapshot)
        } else {
            return Ok(Disposition::Ignored(format!(
                "subscription status {:?} grants no tier",
                sub.status
            )));
        };

        let applied = self.subscriptions.apply_event(user_id, &mutation, None).await?;
        Ok(if applied.changed {
            Disposition::Applied
        } else {
            Disposition::Ignored("subscription state unchanged".to_string())
        })
    }

    async fn handle_subscription_deleted(&self, sub: &SubscriptionObject) -> BillingResult<Disposition> {
        let user_id = match self.resolve_user(sub.user_id_hint(), Some(sub.customer.id())).await {
            Ok(user_id) => user_id,
            // Nothing to end for a customer we never linked
            Err(BillingError::CustomerNotFound(customer_id)) => {
                return Ok(Disposition::Ignored(format!(
                    "customer {} not linked to any user",
                    customer_id
                )))
            }
            Err(e) => return Err(e),
        };

        let mutation = SubscriptionMutation::SubscriptionEnded {
            subscription_id: sub.id.clone(),
        };
        let applied = self.subscriptions.apply_event(user_id, &mutation, None).await?;

        if !applied.changed {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %sub.id,
                current_subscription_id = ?applied.record.provider_subscription_id,
                "Ignoring deletion of a subscription that is not the user's current one"
            );
            return Ok(Disposition::Ignored("stale or already ended subscription".to_string()));
        }
        Ok(Disposition::Applied)
    }

    async fn handle_payment_succeeded(
        &self,
        invoice: &InvoiceObject,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Disposition> {
        let user_id = self.resolve_user(invoice.user_id_hint(), invoice.customer_id()).await?;

        let mutation = SubscriptionMutation::PaymentRecorded {
            amount_cents: invoice.amount_paid,
            paid_at,
            installment_plan: invoice.is_installment_plan(),
        };
        let applied = self.subscriptions.apply_event(user_id, &mutation, None).await?;

        tracing::info!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            amount_cents = invoice.amount_paid,
            total_paid_cents = applied.record.total_paid_cents,
            installment_payments = applied.record.installment_payments,
            "Payment recorded"
        );

        if applied.effects.installment_completed {
            let subscription_id = invoice
                .subscription_id()
                .map(str::to_string)
                .or_else(|| applied.record.provider_subscription_id.clone());
            self.complete_installment_plan(user_id, subscription_id.as_deref()).await?;
        }

        Ok(Disposition::Applied)
    }

    async fn handle_payment_failed(
        &self,
        invoice: &InvoiceObject,
        failed_at: OffsetDateTime,
    ) -> BillingResult<Disposition> {
        let user_id = self.resolve_user(invoice.user_id_hint(), invoice.customer_id()).await?;

        // No tier change: dunning is the provider's job; we surface it to the UI
        tracing::warn!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            "Invoice payment failed"
        );

        let mutation = SubscriptionMutation::PaymentFailed { failed_at };
        self.subscriptions.apply_event(user_id, &mutation, None).await?;
        Ok(Disposition::Applied)
    }

    /// Schedule cancellation at period end at the provider after the Nth installment.
    ///
    /// Runs after the local commit, so any failure is permanent for this event.
    async fn complete_installment_plan(&self, user_id: Uuid, subscription_id: Option<&str>) -> BillingResult<()> {
        let Some(subscription_id) = subscription_id else {
            return Err(BillingError::ReconciliationNeeded(format!(
                "installment plan completed for user {} but no subscription id is known",
                user_id
            )));
        };

        let Some(provider) = &self.provider else {
            return Err(BillingError::ReconciliationNeeded(format!(
                "installment plan completed for subscription {} but provider API is not configured",
                subscription_id
            )));
        };

        provider
            .set_cancel_at_period_end(subscription_id, true)
            .await
            .map_err(|e| {
                BillingError::ReconciliationNeeded(format!(
                    "installment plan completed locally but provider cancel failed for {}: {}",
                    subscription_id, e
                ))
            })?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Installment plan complete, cancellation scheduled at period end"
        );
        Ok(())
    }

    /// Metadata user id first, then the customer index
    async fn resolve_user(&self, hint: Option<&str>, customer_id: Option<&str>) -> BillingResult<Uuid> {
        if let Some(hint) = hint {
            return Uuid::parse_str(hint)
                .map_err(|_| BillingError::InvalidInput(format!("Invalid user_id in event metadata: {}", hint)));
        }

        let Some(customer_id) = customer_id else {
            return Err(BillingError::InvalidInput(
                "event carries neither a user reference nor a customer".to_string(),
            ));
        };

        // Unlinked customers fail transiently: checkout completion may not be recorded yet
        self.subscriptions
            .store()
            .find_user_by_customer(customer_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }
}

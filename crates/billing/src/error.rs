//! Billing error types

use thiserror::Error;

use crate::verify::VerificationError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Webhook verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Customer not linked to any user: {0}")]
    CustomerNotFound(String),

    #[error("Subscription record not found for user {0}")]
    SubscriptionNotFound(String),

    #[error("Version conflict for user {user_id}: expected {expected}, found {actual}")]
    VersionConflict {
        user_id: String,
        expected: i64,
        actual: i64,
    },

    /// Every retry of an unpinned write lost the version race
    #[error("Write for user {user_id} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { user_id: String, attempts: usize },

    /// Another delivery holds a fresh claim on this event
    #[error("Event still being processed: {0}")]
    EventInProgress(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    /// Effects were committed locally but a follow-up step failed; must not be replayed
    #[error("Reconciliation needed: {0}")]
    ReconciliationNeeded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether redelivery or a client retry can succeed without human action.
    /// A pinned `VersionConflict` is not: the caller has to re-read first.
    ///
    /// Drives the webhook 500-vs-ack decision and whether a failed processed-event
    /// row may be reclaimed by a later delivery.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::StripeApi(_)
                | BillingError::ConflictRetriesExhausted { .. }
                | BillingError::EventInProgress(_)
                | BillingError::CustomerNotFound(_)
                | BillingError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

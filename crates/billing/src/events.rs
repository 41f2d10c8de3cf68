//! Provider event envelope
//!
//! Webhook bodies are decoded into our own serde types instead of
//! `stripe::Event`: the envelope only needs `id`, `type`, `created` and
//! `data.object`, and newer provider API versions add fields the pinned
//! async-stripe release rejects.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

/// Subscription metadata key carrying our user id
pub const METADATA_USER_ID: &str = "user_id";

/// Invoice/subscription metadata key marking a fixed-count installment plan
pub const METADATA_INSTALLMENT_PLAN: &str = "installment_plan";

/// Raw envelope as delivered by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Event types this subsystem acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unhandled,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            _ => EventKind::Unhandled,
        }
    }
}

/// `data.object`, decoded according to the event type
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionChanged(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    PaymentSucceeded(InvoiceObject),
    PaymentFailed(InvoiceObject),
    Unhandled,
}

/// A verified, fully decoded provider event
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl ProviderEvent {
    /// Decode an envelope; unknown types decode to `EventPayload::Unhandled`
    pub fn from_envelope(envelope: EventEnvelope) -> Result<Self, serde_json::Error> {
        let kind = EventKind::from_type(&envelope.event_type);
        let object = envelope.data.object;

        let payload = match kind {
            EventKind::CheckoutSessionCompleted => {
                EventPayload::CheckoutCompleted(serde_json::from_value(object)?)
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                EventPayload::SubscriptionChanged(serde_json::from_value(object)?)
            }
            EventKind::SubscriptionDeleted => {
                EventPayload::SubscriptionDeleted(serde_json::from_value(object)?)
            }
            EventKind::InvoicePaymentSucceeded => {
                EventPayload::PaymentSucceeded(serde_json::from_value(object)?)
            }
            EventKind::InvoicePaymentFailed => {
                EventPayload::PaymentFailed(serde_json::from_value(object)?)
            }
            EventKind::Unhandled => EventPayload::Unhandled,
        };

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            created: envelope.created,
            kind,
            payload,
        })
    }

    /// Provider timestamp, falling back to now for envelopes without one
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created).unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

/// An id field the provider may send either bare or expanded into an object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    pub fn id(&self) -> &str {
        match self {
            ExpandableId::Id(id) => id,
            ExpandableId::Object { id } => id,
        }
    }
}

/// Provider subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Paused,
    Incomplete,
    IncompleteExpired,
    Canceled,
    Unknown,
}

impl From<&str> for SubscriptionStatus {
    fn from(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "unpaid" => SubscriptionStatus::Unpaid,
            "paused" => SubscriptionStatus::Paused,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Unknown,
        }
    }
}

impl From<String> for SubscriptionStatus {
    fn from(status: String) -> Self {
        SubscriptionStatus::from(status.as_str())
    }
}

impl SubscriptionStatus {
    /// Whether a subscription in this status entitles the user to its tier.
    ///
    /// Past-due and unpaid keep the tier: dunning belongs to the provider.
    pub fn grants_tier(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active
                | SubscriptionStatus::Trialing
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Unpaid
        )
    }

    /// Terminal: handled the same way as a deletion
    pub fn is_ended(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriceObject {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionItemObject {
    pub price: PriceObject,
    /// Newer API versions report the period per item
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: ExpandableId,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: ItemList,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }

    /// Period end from the subscription, else from its first item
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.items.data.first().and_then(|item| item.current_period_end))
    }

    pub fn user_id_hint(&self) -> Option<&str> {
        self.metadata.get(METADATA_USER_ID).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
    #[serde(default)]
    pub subscription: Option<ExpandableId>,
    /// Minor currency units
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Snapshot of the parent subscription's metadata at invoice time
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

impl InvoiceObject {
    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .or_else(|| {
                self.subscription_details
                    .as_ref()
                    .and_then(|details| details.metadata.get(key))
            })
            .map(String::as_str)
    }

    pub fn is_installment_plan(&self) -> bool {
        self.metadata_value(METADATA_INSTALLMENT_PLAN) == Some("true")
    }

    pub fn user_id_hint(&self) -> Option<&str> {
        self.metadata_value(METADATA_USER_ID)
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ExpandableId::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(ExpandableId::id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
    #[serde(default)]
    pub subscription: Option<ExpandableId>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ExpandableId::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(ExpandableId::id)
    }

    /// Metadata first, then the checkout's client reference
    pub fn user_id_hint(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_USER_ID)
            .map(String::as_str)
            .or(self.client_reference_id.as_deref())
    }
}

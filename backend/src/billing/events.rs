use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// key: billing-events -> closed set of reconciled provider events
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionUpdated(SubscriptionChange),
    SubscriptionDeleted(SubscriptionChange),
    InvoicePaymentSucceeded(InvoicePayment),
    InvoicePaymentFailed(InvoicePayment),
    Unsupported { event_id: String, event_type: String },
}

impl BillingEvent {
    pub fn event_id(&self) -> &str {
        match self {
            BillingEvent::CheckoutCompleted(checkout) => &checkout.event_id,
            BillingEvent::SubscriptionUpdated(change) | BillingEvent::SubscriptionDeleted(change) => {
                &change.event_id
            }
            BillingEvent::InvoicePaymentSucceeded(invoice)
            | BillingEvent::InvoicePaymentFailed(invoice) => &invoice.event_id,
            BillingEvent::Unsupported { event_id, .. } => event_id,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            BillingEvent::CheckoutCompleted(_) => CHECKOUT_COMPLETED,
            BillingEvent::SubscriptionUpdated(_) => SUBSCRIPTION_UPDATED,
            BillingEvent::SubscriptionDeleted(_) => SUBSCRIPTION_DELETED,
            BillingEvent::InvoicePaymentSucceeded(_) => INVOICE_PAYMENT_SUCCEEDED,
            BillingEvent::InvoicePaymentFailed(_) => INVOICE_PAYMENT_FAILED,
            BillingEvent::Unsupported { event_type, .. } => event_type,
        }
    }

    /// External subscription referenced by the event, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            BillingEvent::CheckoutCompleted(checkout) => checkout.subscription_id.as_deref(),
            BillingEvent::SubscriptionUpdated(change) | BillingEvent::SubscriptionDeleted(change) => {
                Some(&change.subscription_id)
            }
            BillingEvent::InvoicePaymentSucceeded(invoice)
            | BillingEvent::InvoicePaymentFailed(invoice) => invoice.subscription_id.as_deref(),
            BillingEvent::Unsupported { .. } => None,
        }
    }
}

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutCompleted {
    pub event_id: String,
    pub session_id: String,
    /// Local provider id passed through `client_reference_id` or metadata.
    pub provider_ref: Option<Uuid>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_status: Option<ExternalStatus>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub plan: Option<String>,
}

impl CheckoutCompleted {
    /// Whether the session only carried the subscription id, leaving its
    /// status and period unknown.
    pub fn needs_subscription_details(&self) -> bool {
        self.subscription_id.is_some() && self.subscription_status.is_none()
    }

    /// Fills the subscription fields from a fetched or expanded subscription.
    /// Values already present on the session win.
    pub fn apply_snapshot(&mut self, snapshot: SubscriptionSnapshot) {
        self.subscription_status = Some(snapshot.status);
        self.period_start = snapshot.period_start;
        self.period_end = snapshot.period_end;
        if self.plan.is_none() {
            self.plan = snapshot.plan;
        }
        if self.customer_id.is_none() {
            self.customer_id = snapshot.customer_id;
        }
        self.subscription_id = Some(snapshot.subscription_id);
    }
}

/// Current state of one external subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub status: ExternalStatus,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionChange {
    pub event_id: String,
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub status: ExternalStatus,
    pub period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoicePayment {
    pub event_id: String,
    pub invoice_id: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub plan: Option<String>,
    pub period_end: Option<DateTime<Utc>>,
}

/// Subscription status as reported by the billing provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStatus {
    Active,
    PastDue,
    Canceled,
    Trialing,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Other(String),
}

impl From<&str> for ExternalStatus {
    fn from(value: &str) -> Self {
        match value {
            "active" => ExternalStatus::Active,
            "past_due" => ExternalStatus::PastDue,
            "canceled" | "cancelled" => ExternalStatus::Canceled,
            "trialing" => ExternalStatus::Trialing,
            "unpaid" => ExternalStatus::Unpaid,
            "incomplete" => ExternalStatus::Incomplete,
            "incomplete_expired" => ExternalStatus::IncompleteExpired,
            other => ExternalStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{event_type}` event missing `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
    #[error("invalid timestamp {0}")]
    Timestamp(i64),
}

#[derive(Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: Value,
}

/// Fields the provider may send either as an id or as the expanded object.
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable<T> {
    Id(String),
    Object(T),
}

#[derive(Deserialize)]
struct RawObjectRef {
    id: String,
}

impl Expandable<RawObjectRef> {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(object) => object.id,
        }
    }
}

#[derive(Deserialize)]
struct RawList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    status: String,
    customer: Option<Expandable<RawObjectRef>>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    items: Option<RawList<RawSubscriptionItem>>,
}

#[derive(Deserialize)]
struct RawSubscriptionItem {
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    price: Option<RawPrice>,
}

#[derive(Deserialize)]
struct RawPrice {
    id: String,
    nickname: Option<String>,
}

impl RawPrice {
    fn label(self) -> String {
        self.nickname.filter(|n| !n.is_empty()).unwrap_or(self.id)
    }
}

impl RawSubscription {
    fn period_start(&self) -> Option<i64> {
        self.current_period_start.or_else(|| {
            self.items
                .as_ref()
                .and_then(|items| items.data.first())
                .and_then(|item| item.current_period_start)
        })
    }

    fn period_end(&self) -> Option<i64> {
        self.current_period_end.or_else(|| {
            self.items
                .as_ref()
                .and_then(|items| items.data.first())
                .and_then(|item| item.current_period_end)
        })
    }
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    client_reference_id: Option<String>,
    metadata: Option<HashMap<String, String>>,
    customer: Option<Expandable<RawObjectRef>>,
    subscription: Option<Expandable<RawSubscription>>,
    amount_total: Option<i64>,
    currency: Option<String>,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    customer: Option<Expandable<RawObjectRef>>,
    subscription: Option<Expandable<RawObjectRef>>,
    parent: Option<RawInvoiceParent>,
    amount_paid: Option<i64>,
    amount_due: Option<i64>,
    currency: Option<String>,
    period_end: Option<i64>,
    lines: Option<RawList<RawInvoiceLine>>,
}

#[derive(Deserialize)]
struct RawInvoiceParent {
    subscription_details: Option<RawSubscriptionDetails>,
}

#[derive(Deserialize)]
struct RawSubscriptionDetails {
    subscription: Option<Expandable<RawObjectRef>>,
}

#[derive(Deserialize)]
struct RawInvoiceLine {
    period: Option<RawPeriod>,
    price: Option<RawPrice>,
    plan: Option<RawPrice>,
}

#[derive(Deserialize)]
struct RawPeriod {
    end: Option<i64>,
}

/// Parses a verified webhook body into a [`BillingEvent`]. Unknown event
/// types are returned as [`BillingEvent::Unsupported`] rather than errors.
pub fn parse_event(payload: &[u8]) -> Result<BillingEvent, EventParseError> {
    let envelope: RawEnvelope = serde_json::from_slice(payload)?;
    let RawEnvelope {
        id: event_id,
        event_type,
        data,
    } = envelope;

    match event_type.as_str() {
        CHECKOUT_COMPLETED => {
            let session: RawCheckoutSession = serde_json::from_value(data.object)?;
            parse_checkout(event_id, session).map(BillingEvent::CheckoutCompleted)
        }
        SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED | SUBSCRIPTION_DELETED => {
            let subscription: RawSubscription = serde_json::from_value(data.object)?;
            let change = SubscriptionChange {
                event_id,
                status: ExternalStatus::from(subscription.status.as_str()),
                period_end: timestamp(subscription.period_end())?,
                customer_id: subscription.customer.map(|value| value.into_id()),
                subscription_id: subscription.id,
            };
            if event_type == SUBSCRIPTION_DELETED {
                Ok(BillingEvent::SubscriptionDeleted(change))
            } else {
                Ok(BillingEvent::SubscriptionUpdated(change))
            }
        }
        INVOICE_PAYMENT_SUCCEEDED | INVOICE_PAID => {
            let invoice: RawInvoice = serde_json::from_value(data.object)?;
            parse_invoice(event_id, invoice).map(BillingEvent::InvoicePaymentSucceeded)
        }
        INVOICE_PAYMENT_FAILED => {
            let invoice: RawInvoice = serde_json::from_value(data.object)?;
            parse_invoice(event_id, invoice).map(BillingEvent::InvoicePaymentFailed)
        }
        _ => Ok(BillingEvent::Unsupported {
            event_id,
            event_type,
        }),
    }
}

fn parse_checkout(
    event_id: String,
    session: RawCheckoutSession,
) -> Result<CheckoutCompleted, EventParseError> {
    let metadata = session.metadata.unwrap_or_default();
    let provider_ref = session
        .client_reference_id
        .as_deref()
        .or_else(|| metadata.get("provider_id").map(String::as_str))
        .and_then(|value| Uuid::parse_str(value.trim()).ok());
    let plan = metadata.get("plan").cloned();

    let mut checkout = CheckoutCompleted {
        event_id,
        session_id: session.id,
        provider_ref,
        customer_id: session.customer.map(|value| value.into_id()),
        subscription_id: None,
        subscription_status: None,
        period_start: None,
        period_end: None,
        amount_cents: session.amount_total,
        currency: session.currency,
        plan,
    };

    match session.subscription {
        Some(Expandable::Id(id)) => checkout.subscription_id = Some(id),
        Some(Expandable::Object(subscription)) => {
            checkout.apply_snapshot(snapshot(subscription)?);
        }
        None => {}
    }

    if checkout.provider_ref.is_none()
        && checkout.customer_id.is_none()
        && checkout.subscription_id.is_none()
    {
        return Err(EventParseError::MissingField {
            event_type: CHECKOUT_COMPLETED.to_string(),
            field: "client_reference_id",
        });
    }
    Ok(checkout)
}

/// Parses a subscription object as returned by the billing provider's API.
pub fn parse_subscription(payload: &[u8]) -> Result<SubscriptionSnapshot, EventParseError> {
    let subscription: RawSubscription = serde_json::from_slice(payload)?;
    snapshot(subscription)
}

fn snapshot(subscription: RawSubscription) -> Result<SubscriptionSnapshot, EventParseError> {
    Ok(SubscriptionSnapshot {
        status: ExternalStatus::from(subscription.status.as_str()),
        period_start: timestamp(subscription.period_start())?,
        period_end: timestamp(subscription.period_end())?,
        customer_id: subscription.customer.map(|value| value.into_id()),
        plan: subscription
            .items
            .and_then(|items| items.data.into_iter().next())
            .and_then(|item| item.price)
            .map(RawPrice::label),
        subscription_id: subscription.id,
    })
}

fn parse_invoice(event_id: String, invoice: RawInvoice) -> Result<InvoicePayment, EventParseError> {
    let subscription_id = invoice.subscription.map(|value| value.into_id()).or_else(|| {
        invoice
            .parent
            .and_then(|parent| parent.subscription_details)
            .and_then(|details| details.subscription)
            .map(|value| value.into_id())
    });
    let first_line = invoice
        .lines
        .and_then(|lines| lines.data.into_iter().next());
    let (line_end, plan) = match first_line {
        Some(line) => (
            line.period.and_then(|period| period.end),
            line.price.or(line.plan).map(RawPrice::label),
        ),
        None => (None, None),
    };

    Ok(InvoicePayment {
        event_id,
        invoice_id: invoice.id,
        subscription_id,
        customer_id: invoice.customer.map(|value| value.into_id()),
        amount_cents: invoice.amount_paid.or(invoice.amount_due),
        currency: invoice.currency,
        plan,
        period_end: timestamp(line_end.or(invoice.period_end))?,
    })
}

fn timestamp(seconds: Option<i64>) -> Result<Option<DateTime<Utc>>, EventParseError> {
    match seconds {
        None => Ok(None),
        Some(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(Some)
            .ok_or(EventParseError::Timestamp(secs)),
    }
}

pub mod api;
pub mod events;
pub mod lookup;
pub mod models;
pub mod reconciliation;
pub mod service;
pub mod signature;
pub mod store;

pub use api::{routes, WebhookAck, SIGNATURE_HEADER};
pub use events::{
    parse_event, parse_subscription, BillingEvent, EventParseError, ExternalStatus,
    SubscriptionSnapshot,
};
pub use lookup::{HttpSubscriptionLookup, SubscriptionLookup};
pub use models::{
    ManualGrant, NewHistoryEntry, ProviderBilling, StatusWrite, SubscriptionHistoryEntry, SubscriptionPlan,
    SubscriptionSource, SubscriptionStatus,
};
pub use reconciliation::{decide, Decision};
pub use service::{lifetime_end, BillingService, ReconciliationOutcome, Revocation};
pub use signature::{SignatureError, WebhookVerifier};
pub use store::{BillingStore, PgBillingStore};

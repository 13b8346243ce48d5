use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::events::{BillingEvent, ExternalStatus};
use super::models::{
    ManualGrant, NewHistoryEntry, ProviderBilling, StatusWrite, SubscriptionSource,
    SubscriptionStatus,
};

/// key: billing-reconciliation -> outcome of applying one event to one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Write(StatusWrite),
    PreserveManualGrant(ManualGrant),
    NoChange { reason: String },
}

/// Maps a billing event onto the provider it references.
///
/// Manual grants take precedence over every external event: an administrator
/// grant is only ever removed by an administrator.
pub fn decide(event: &BillingEvent, provider: &ProviderBilling, now: DateTime<Utc>) -> Decision {
    if let SubscriptionSource::ManualGrant(grant) = provider.source() {
        if !matches!(event, BillingEvent::Unsupported { .. }) {
            return Decision::PreserveManualGrant(grant);
        }
    }

    match event {
        BillingEvent::CheckoutCompleted(checkout) if checkout.needs_subscription_details() => {
            // status and period arrive with the subscription's own events
            Decision::Write(StatusWrite {
                stripe_customer_id: checkout.customer_id.clone(),
                stripe_subscription_id: checkout.subscription_id.clone(),
                ..StatusWrite::status(provider.subscription_status)
            })
        }
        BillingEvent::CheckoutCompleted(checkout) => {
            let status = match checkout.subscription_status {
                Some(ExternalStatus::Trialing) => SubscriptionStatus::Trial,
                _ => SubscriptionStatus::Active,
            };
            Decision::Write(StatusWrite {
                status,
                stripe_customer_id: checkout.customer_id.clone(),
                stripe_subscription_id: checkout.subscription_id.clone(),
                start_date: Some(checkout.period_start.unwrap_or(now)),
                end_date: checkout.period_end,
            })
        }
        BillingEvent::SubscriptionUpdated(change) => match local_status(&change.status) {
            Some(status) => Decision::Write(StatusWrite {
                end_date: change.period_end,
                ..StatusWrite::status(status)
            }),
            None => Decision::NoChange {
                reason: format!("external status {:?} has no local mapping", change.status),
            },
        },
        BillingEvent::SubscriptionDeleted(_) => Decision::Write(StatusWrite {
            end_date: Some(now),
            ..StatusWrite::status(SubscriptionStatus::Expired)
        }),
        BillingEvent::InvoicePaymentFailed(_) => {
            Decision::Write(StatusWrite::status(SubscriptionStatus::PastDue))
        }
        BillingEvent::InvoicePaymentSucceeded(invoice) => Decision::Write(StatusWrite {
            end_date: invoice.period_end,
            ..StatusWrite::status(SubscriptionStatus::Active)
        }),
        BillingEvent::Unsupported { event_type, .. } => Decision::NoChange {
            reason: format!("unsupported event `{event_type}`"),
        },
    }
}

pub(crate) fn local_status(external: &ExternalStatus) -> Option<SubscriptionStatus> {
    match external {
        ExternalStatus::Active => Some(SubscriptionStatus::Active),
        ExternalStatus::PastDue | ExternalStatus::Unpaid => Some(SubscriptionStatus::PastDue),
        ExternalStatus::Canceled | ExternalStatus::IncompleteExpired => {
            Some(SubscriptionStatus::Expired)
        }
        ExternalStatus::Trialing => Some(SubscriptionStatus::Trial),
        ExternalStatus::Incomplete => Some(SubscriptionStatus::Pending),
        ExternalStatus::Other(_) => None,
    }
}

/// Ledger row for events that represent money received, keyed on the
/// provider-side session or invoice id.
pub fn history_entry(
    event: &BillingEvent,
    provider_id: Uuid,
    now: DateTime<Utc>,
) -> Option<NewHistoryEntry> {
    match event {
        BillingEvent::CheckoutCompleted(checkout) => Some(NewHistoryEntry {
            provider_id,
            external_id: checkout.session_id.clone(),
            event_type: event.event_type().to_string(),
            amount_cents: checkout.amount_cents,
            currency: checkout.currency.clone(),
            plan: checkout.plan.clone(),
            recorded_at: now,
        }),
        BillingEvent::InvoicePaymentSucceeded(invoice) => Some(NewHistoryEntry {
            provider_id,
            external_id: invoice.invoice_id.clone(),
            event_type: event.event_type().to_string(),
            amount_cents: invoice.amount_cents,
            currency: invoice.currency.clone(),
            plan: invoice.plan.clone(),
            recorded_at: now,
        }),
        _ => None,
    }
}

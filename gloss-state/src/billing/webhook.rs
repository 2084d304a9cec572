//! Reconciles verified Stripe lifecycle events into the entitlement
//! store. Delivery is at-least-once and may be out of order, so every
//! application is idempotent: a replay produces a no-op patch, and
//! subscription events older than the last applied one are dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::billing::stripe::BillingProvider;
use crate::billing::{SubscriptionStatus, SubscriptionTier};
use crate::datastore::DataStore;
use crate::entitlements::{EntitlementPatch, UserEntitlement};
use crate::errors::StateError;

#[derive(Debug, Clone, Deserialize)]
struct EventEnvelope {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// A completed checkout session, as delivered inside the event payload
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub customer: String,
    #[serde(default)]
    pub subscription: Option<String>,
    pub metadata: CheckoutMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutMetadata {
    pub user_id: String,
    pub plan: String,
}

/// A subscription create/update/delete, as delivered inside the event
/// payload, plus the envelope's creation time for the stale guard
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionUpdate {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(skip)]
    pub event_created: i64,
}

/// Provider lifecycle events this service reacts to. Everything else
/// parses to `Ignored` so new provider event types never break intake.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutSession),
    SubscriptionChanged(SubscriptionUpdate),
    Ignored { event_type: String },
}

/// Parse a verified webhook payload into a typed event.
pub fn parse_event(payload: &[u8]) -> Result<BillingEvent, StateError> {
    let envelope: EventEnvelope = serde_json::from_slice(payload)
        .map_err(|e| StateError::InvalidEvent(format!("malformed event payload: {e}")))?;

    match envelope.event_type.as_str() {
        "checkout.session.completed" => {
            let session: CheckoutSession = serde_json::from_value(envelope.data.object)
                .map_err(|e| {
                    StateError::InvalidEvent(format!(
                        "malformed checkout session in event {}: {e}",
                        envelope.id
                    ))
                })?;
            Ok(BillingEvent::CheckoutCompleted(session))
        }
        "customer.subscription.updated" | "customer.subscription.deleted" => {
            let mut update: SubscriptionUpdate = serde_json::from_value(envelope.data.object)
                .map_err(|e| {
                    StateError::InvalidEvent(format!(
                        "malformed subscription in event {}: {e}",
                        envelope.id
                    ))
                })?;
            update.event_created = envelope.created;
            Ok(BillingEvent::SubscriptionChanged(update))
        }
        other => Ok(BillingEvent::Ignored {
            event_type: other.to_string(),
        }),
    }
}

/// A checkout completed: upsert the entitlement BY USER ID, since the
/// local record may predate any provider identifier (or may not exist
/// at all if checkout happened before the first query). The real email
/// and the subscription period come from the provider, not the event.
pub async fn apply_checkout_completed(
    state: Arc<Mutex<DataStore>>,
    provider: &dyn BillingProvider,
    session: CheckoutSession,
) -> Result<UserEntitlement, StateError> {
    let tier = SubscriptionTier::from_plan(&session.metadata.plan).ok_or_else(|| {
        StateError::InvalidEvent(format!(
            "checkout session {} carries unknown plan {:?}",
            session.id, session.metadata.plan
        ))
    })?;

    let customer = provider.retrieve_customer(&session.customer).await?;

    let mut patch = EntitlementPatch {
        email: customer.email,
        provider_customer_id: Some(session.customer.clone()),
        tier: Some(tier),
        status: Some(SubscriptionStatus::Active),
        ..Default::default()
    };
    if let Some(subscription_id) = &session.subscription {
        let subscription = provider.retrieve_subscription(subscription_id).await?;
        patch.provider_subscription_id = Some(subscription.id);
        patch.period_end = DateTime::from_timestamp(subscription.current_period_end, 0);
        patch.cancel_at_period_end = Some(subscription.cancel_at_period_end);
    }

    let mut datastore = state.lock().await;
    let record =
        datastore.apply_patch_by_user(&session.metadata.user_id, &patch, Utc::now())?;
    log::info!(
        "user {} upgraded to {:?} via checkout {}",
        record.user_id,
        record.tier,
        session.id
    );
    Ok(record)
}

/// A subscription changed: look the record up by customer reference.
/// An unknown customer is reported as `NotFound` and mutates nothing;
/// the provider's retries cannot fix that, so it is logged, not raised
/// to the transport layer. Events older than the last applied one are
/// dropped as stale.
pub async fn apply_subscription_changed(
    state: Arc<Mutex<DataStore>>,
    update: SubscriptionUpdate,
) -> Result<UserEntitlement, StateError> {
    let now = Utc::now();
    let event_at = DateTime::from_timestamp(update.event_created, 0).ok_or_else(|| {
        StateError::InvalidEvent(format!(
            "subscription event for {} carries invalid timestamp {}",
            update.id, update.event_created
        ))
    })?;

    let mut datastore = state.lock().await;

    let current = datastore
        .find_by_customer(&update.customer)
        .cloned()
        .ok_or_else(|| {
            StateError::NotFound(format!("entitlement referencing customer {}", update.customer))
        })?;

    if let Some(last_applied) = current.subscription_event_at {
        if event_at < last_applied {
            log::warn!(
                "dropping stale subscription event for user {}: {} < {}",
                current.user_id,
                event_at,
                last_applied
            );
            return Ok(current);
        }
    }

    let status = SubscriptionStatus::from_provider(&update.status);
    let patch = EntitlementPatch {
        status: Some(status),
        period_end: DateTime::from_timestamp(update.current_period_end, 0),
        cancel_at_period_end: Some(update.cancel_at_period_end),
        subscription_event_at: Some(event_at),
        ..Default::default()
    };

    let record = datastore.apply_patch_by_customer(&update.customer, &patch, now)?;
    log::info!(
        "user {} subscription now {:?} (provider status {:?})",
        record.user_id,
        record.status,
        update.status
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::stripe::{CustomerDetails, SubscriptionDetails};
    use axum::async_trait;

    struct StubProvider {
        email: Option<String>,
        period_end: i64,
    }

    #[async_trait]
    impl BillingProvider for StubProvider {
        async fn retrieve_customer(&self, customer_id: &str) -> Result<CustomerDetails, StateError> {
            Ok(CustomerDetails {
                id: customer_id.to_string(),
                email: self.email.clone(),
            })
        }

        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<SubscriptionDetails, StateError> {
            Ok(SubscriptionDetails {
                id: subscription_id.to_string(),
                status: "active".to_string(),
                current_period_end: self.period_end,
                cancel_at_period_end: false,
            })
        }
    }

    fn shared_store() -> Arc<Mutex<DataStore>> {
        Arc::new(Mutex::new(DataStore::in_memory()))
    }

    fn checkout_event(user_id: &str, plan: &str) -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "cs_test_1",
                "customer": "cus_123",
                "subscription": "sub_456",
                "metadata": { "user_id": user_id, "plan": plan }
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn subscription_event(status: &str, created: i64, period_end: i64) -> Vec<u8> {
        serde_json::json!({
            "id": "evt_2",
            "type": "customer.subscription.updated",
            "created": created,
            "data": { "object": {
                "id": "sub_456",
                "customer": "cus_123",
                "status": status,
                "current_period_end": period_end,
                "cancel_at_period_end": false
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn future_ts() -> i64 {
        (Utc::now() + chrono::Duration::days(30)).timestamp()
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let payload = serde_json::json!({
            "id": "evt_3",
            "type": "invoice.payment_succeeded",
            "created": 1_700_000_000,
            "data": { "object": {} }
        })
        .to_string();

        match parse_event(payload.as_bytes()).unwrap() {
            BillingEvent::Ignored { event_type } => {
                assert_eq!(event_type, "invoice.payment_succeeded")
            }
            other => panic!("expected Ignored, got {:?}", other),
        }
    }

    #[test]
    fn garbage_payload_is_invalid() {
        assert!(matches!(
            parse_event(b"not json"),
            Err(StateError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn checkout_creates_and_upgrades_unknown_user() {
        let state = shared_store();
        let provider = StubProvider {
            email: Some("real@example.com".to_string()),
            period_end: future_ts(),
        };

        let event = parse_event(&checkout_event("user-1", "monthly")).unwrap();
        let session = match event {
            BillingEvent::CheckoutCompleted(session) => session,
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        };

        let record = apply_checkout_completed(state.clone(), &provider, session)
            .await
            .unwrap();
        assert_eq!(record.tier, SubscriptionTier::Monthly);
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.email, "real@example.com");
        assert_eq!(record.provider_customer_id.as_deref(), Some("cus_123"));
        assert_eq!(record.provider_subscription_id.as_deref(), Some("sub_456"));
        assert!(record.is_premium_equivalent(Utc::now()));
    }

    #[tokio::test]
    async fn checkout_replay_is_idempotent() {
        let state = shared_store();
        let provider = StubProvider {
            email: Some("real@example.com".to_string()),
            period_end: future_ts(),
        };

        let session = match parse_event(&checkout_event("user-1", "annual")).unwrap() {
            BillingEvent::CheckoutCompleted(session) => session,
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        };

        let first = apply_checkout_completed(state.clone(), &provider, session.clone())
            .await
            .unwrap();
        let second = apply_checkout_completed(state.clone(), &provider, session)
            .await
            .unwrap();
        // byte-identical after the replay, updated_at included
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_without_mutation() {
        let state = shared_store();
        let provider = StubProvider {
            email: None,
            period_end: future_ts(),
        };

        let session = match parse_event(&checkout_event("user-1", "platinum")).unwrap() {
            BillingEvent::CheckoutCompleted(session) => session,
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        };

        let err = apply_checkout_completed(state.clone(), &provider, session).await;
        assert!(matches!(err, Err(StateError::InvalidEvent(_))));
        assert!(state.lock().await.get("user-1").is_none());
    }

    #[tokio::test]
    async fn subscription_change_maps_status_and_period() {
        let state = shared_store();
        let provider = StubProvider {
            email: None,
            period_end: future_ts(),
        };

        let session = match parse_event(&checkout_event("user-1", "monthly")).unwrap() {
            BillingEvent::CheckoutCompleted(session) => session,
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        };
        apply_checkout_completed(state.clone(), &provider, session)
            .await
            .unwrap();

        let new_period_end = future_ts() + 86_400;
        let update = match parse_event(&subscription_event("active", 1_700_000_100, new_period_end))
            .unwrap()
        {
            BillingEvent::SubscriptionChanged(update) => update,
            other => panic!("expected SubscriptionChanged, got {:?}", other),
        };
        let record = apply_subscription_changed(state.clone(), update).await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(
            record.period_end,
            DateTime::from_timestamp(new_period_end, 0)
        );
        assert!(record.is_premium_equivalent(Utc::now()));

        // cancellation keeps the last known period end
        let update =
            match parse_event(&subscription_event("canceled", 1_700_000_200, new_period_end))
                .unwrap()
            {
                BillingEvent::SubscriptionChanged(update) => update,
                other => panic!("expected SubscriptionChanged, got {:?}", other),
            };
        let record = apply_subscription_changed(state.clone(), update).await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(
            record.period_end,
            DateTime::from_timestamp(new_period_end, 0)
        );
        assert!(!record.is_premium_equivalent(Utc::now()));
    }

    #[tokio::test]
    async fn stale_subscription_event_is_dropped() {
        let state = shared_store();
        let provider = StubProvider {
            email: None,
            period_end: future_ts(),
        };

        let session = match parse_event(&checkout_event("user-1", "monthly")).unwrap() {
            BillingEvent::CheckoutCompleted(session) => session,
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        };
        apply_checkout_completed(state.clone(), &provider, session)
            .await
            .unwrap();

        let cancel = match parse_event(&subscription_event("canceled", 2_000, future_ts())).unwrap()
        {
            BillingEvent::SubscriptionChanged(update) => update,
            other => panic!("expected SubscriptionChanged, got {:?}", other),
        };
        apply_subscription_changed(state.clone(), cancel).await.unwrap();

        // an older "active" delivery arrives late; it must not win
        let stale = match parse_event(&subscription_event("active", 1_000, future_ts())).unwrap() {
            BillingEvent::SubscriptionChanged(update) => update,
            other => panic!("expected SubscriptionChanged, got {:?}", other),
        };
        let record = apply_subscription_changed(state.clone(), stale).await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn unknown_customer_reports_not_found_and_mutates_nothing() {
        let state = shared_store();

        let update = match parse_event(&subscription_event("active", 1_700_000_000, future_ts()))
            .unwrap()
        {
            BillingEvent::SubscriptionChanged(update) => update,
            other => panic!("expected SubscriptionChanged, got {:?}", other),
        };

        let err = apply_subscription_changed(state.clone(), update).await;
        assert!(matches!(err, Err(StateError::NotFound(_))));
        assert!(state.lock().await.entitlement_state.is_empty());
    }
}

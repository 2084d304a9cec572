//! The usage meter: daily quota checks, the commit that actually
//! consumes a unit, and the read-only entitlement view.
//!
//! Check and commit are deliberately split: a cache hit still consumes
//! one unit, but a generator failure must not. Callers check first,
//! perform the metered operation, then commit once a response body is
//! ready. The commit re-validates the quota inside one lock hold, so
//! concurrent requests cannot push `usage_today` past the limit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::billing::{next_reset, QuotaPolicy, SubscriptionStatus, SubscriptionTier};
use crate::datastore::DataStore;
use crate::errors::StateError;

/// Outcome of a pre-flight quota check. Nothing has been consumed yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageDecision {
    pub allowed: bool,
    pub tier: SubscriptionTier,
    pub limit: u32,
    pub remaining: u32,
}

/// Read-only view combining tier, subscription state and today's usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementView {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub usage_today: u32,
    pub limit: u32,
    pub remaining: u32,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Check whether the user may perform one metered operation right now.
/// Applies the daily rollover, never increments the counter.
pub async fn check_quota(
    state: Arc<Mutex<DataStore>>,
    user_id: &str,
    policy: &QuotaPolicy,
) -> Result<UsageDecision, StateError> {
    let now = Utc::now();
    let mut datastore = state.lock().await;
    let record = datastore.current(user_id, now)?;
    let limit = record.quota_for(policy, now);

    if record.usage_today >= limit {
        return Ok(UsageDecision {
            allowed: false,
            tier: record.tier,
            limit,
            remaining: 0,
        });
    }

    Ok(UsageDecision {
        allowed: true,
        tier: record.tier,
        limit,
        remaining: limit - record.usage_today,
    })
}

/// Consume one unit. Increment-if-below-limit performed under a single
/// lock hold; returns the remaining allowance, or `QuotaExceeded` if a
/// concurrent request used up the last unit since the check.
pub async fn commit_usage(
    state: Arc<Mutex<DataStore>>,
    user_id: &str,
    policy: &QuotaPolicy,
) -> Result<u32, StateError> {
    let now = Utc::now();
    let mut datastore = state.lock().await;
    let record = datastore.current(user_id, now)?;
    let limit = record.quota_for(policy, now);

    if record.usage_today >= limit {
        return Err(StateError::QuotaExceeded {
            limit,
            reset_at: next_reset(now),
        });
    }

    let updated = datastore.update(user_id, |record| {
        record.usage_today += 1;
        record.updated_at = now;
        true
    })?;
    log::info!(
        "usage committed for user {}: {}/{} ({:?} tier)",
        user_id,
        updated.usage_today,
        limit,
        updated.tier
    );
    Ok(limit.saturating_sub(updated.usage_today))
}

/// The query service read path: rollover applied, nothing consumed.
pub async fn resolve(
    state: Arc<Mutex<DataStore>>,
    user_id: &str,
    policy: &QuotaPolicy,
) -> Result<EntitlementView, StateError> {
    let now = Utc::now();
    let mut datastore = state.lock().await;
    let record = datastore.current(user_id, now)?;
    let limit = record.quota_for(policy, now);

    Ok(EntitlementView {
        tier: record.tier,
        status: record.status,
        usage_today: record.usage_today,
        limit,
        remaining: limit.saturating_sub(record.usage_today),
        period_end: record.period_end,
        cancel_at_period_end: record.cancel_at_period_end,
    })
}

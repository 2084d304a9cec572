use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::billing::{QuotaPolicy, SubscriptionStatus, SubscriptionTier};

/// Represents one user's entitlement: tier, subscription linkage and
/// the rolling daily usage counter. The aggregate root of the store,
/// keyed by the opaque `user_id` the extension generates on install.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEntitlement {
    /// Opaque stable identifier, unique and immutable once created
    pub user_id: String,
    /// Best-effort contact address; a placeholder until a real payment
    /// email is observed at checkout
    pub email: String,
    /// Stripe customer reference. May go stale (e.g. a test/live mode
    /// switch) and is treated as unverified until re-confirmed.
    #[serde(default)]
    pub provider_customer_id: Option<String>,
    /// Reference to the most recent recurring subscription, if any
    #[serde(default)]
    pub provider_subscription_id: Option<String>,
    /// Product plan level
    #[serde(default)]
    pub tier: SubscriptionTier,
    /// Local mirror of the provider's subscription status
    #[serde(default)]
    pub status: SubscriptionStatus,
    /// When current paid access lapses; irrelevant for lifetime
    #[serde(default)]
    pub period_end: Option<DateTime<Utc>>,
    /// Informational only; does not change current access
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Explanations consumed so far in the current UTC day
    #[serde(default)]
    pub usage_today: u32,
    /// UTC calendar date of the last counter reset; the rollover guard
    pub last_reset_date: NaiveDate,
    /// Provider-side creation time of the last applied subscription
    /// lifecycle event; stale events are rejected against this
    #[serde(default)]
    pub subscription_event_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last effective mutation time, for auditing
    pub updated_at: DateTime<Utc>,
}

/// Partial-field update for a [`UserEntitlement`]. Fields left `None`
/// are untouched; applying a patch that changes nothing is a no-op and
/// does not bump `updated_at`.
#[derive(Clone, Debug, Default)]
pub struct EntitlementPatch {
    pub email: Option<String>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub tier: Option<SubscriptionTier>,
    pub status: Option<SubscriptionStatus>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
    pub subscription_event_at: Option<DateTime<Utc>>,
}

impl UserEntitlement {
    /// Create a default free-tier record for an unknown user.
    pub fn new(user_id: String, now: DateTime<Utc>) -> Self {
        let email = format!("user_{}@pending.glossmath.app", user_id);
        Self {
            user_id,
            email,
            provider_customer_id: None,
            provider_subscription_id: None,
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::None,
            period_end: None,
            cancel_at_period_end: false,
            usage_today: 0,
            last_reset_date: now.date_naive(),
            subscription_event_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this user currently gets the premium quota: lifetime
    /// always does; monthly/annual only while the subscription is
    /// active and the paid period has not lapsed. Any other
    /// combination resolves to the free quota.
    pub fn is_premium_equivalent(&self, now: DateTime<Utc>) -> bool {
        match self.tier {
            SubscriptionTier::Lifetime => true,
            SubscriptionTier::Monthly | SubscriptionTier::Annual => {
                self.status == SubscriptionStatus::Active
                    && self.period_end.map(|end| end > now).unwrap_or(false)
            }
            SubscriptionTier::Free => false,
        }
    }

    /// The daily quota implied by the record's current tier and status.
    /// Always derived fresh, never cached.
    pub fn quota_for(&self, policy: &QuotaPolicy, now: DateTime<Utc>) -> u32 {
        if self.is_premium_equivalent(now) {
            policy.premium_daily
        } else {
            policy.free_daily
        }
    }

    /// Apply the once-daily reset transition. Returns true if the
    /// counter was reset. Applying it again on the same day is a no-op,
    /// so replays and double-application are harmless.
    pub fn roll_over(&mut self, today: NaiveDate, now: DateTime<Utc>) -> bool {
        if self.last_reset_date != today {
            self.usage_today = 0;
            self.last_reset_date = today;
            self.updated_at = now;
            true
        } else {
            false
        }
    }

    /// Apply a partial patch. Returns true if any field actually
    /// changed; only then is `updated_at` bumped. This keeps replayed
    /// provider events from churning the record.
    pub fn apply_patch(&mut self, patch: &EntitlementPatch, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if let Some(email) = &patch.email {
            if &self.email != email {
                self.email = email.clone();
                changed = true;
            }
        }
        if let Some(customer_id) = &patch.provider_customer_id {
            if self.provider_customer_id.as_ref() != Some(customer_id) {
                self.provider_customer_id = Some(customer_id.clone());
                changed = true;
            }
        }
        if let Some(subscription_id) = &patch.provider_subscription_id {
            if self.provider_subscription_id.as_ref() != Some(subscription_id) {
                self.provider_subscription_id = Some(subscription_id.clone());
                changed = true;
            }
        }
        if let Some(tier) = patch.tier {
            if self.tier != tier {
                self.tier = tier;
                changed = true;
            }
        }
        if let Some(status) = patch.status {
            if self.status != status {
                self.status = status;
                changed = true;
            }
        }
        if let Some(period_end) = patch.period_end {
            if self.period_end != Some(period_end) {
                self.period_end = Some(period_end);
                changed = true;
            }
        }
        if let Some(cancel) = patch.cancel_at_period_end {
            if self.cancel_at_period_end != cancel {
                self.cancel_at_period_end = cancel;
                changed = true;
            }
        }
        if let Some(event_at) = patch.subscription_event_at {
            if self.subscription_event_at != Some(event_at) {
                self.subscription_event_at = Some(event_at);
                changed = true;
            }
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }
}

/// In-memory container for all entitlement records
#[derive(Clone, Debug, Default)]
pub struct EntitlementState {
    map: BTreeMap<String, UserEntitlement>,
}

impl EntitlementState {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&UserEntitlement> {
        self.map.get(user_id)
    }

    pub fn get_mut(&mut self, user_id: &str) -> Option<&mut UserEntitlement> {
        self.map.get_mut(user_id)
    }

    pub fn insert(&mut self, record: UserEntitlement) {
        self.map.insert(record.user_id.clone(), record);
    }

    /// Reverse lookup by the Stripe customer reference.
    pub fn find_by_customer(&self, customer_id: &str) -> Option<&UserEntitlement> {
        self.map
            .values()
            .find(|record| record.provider_customer_id.as_deref() == Some(customer_id))
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn active_monthly(now: DateTime<Utc>) -> UserEntitlement {
        let mut record = UserEntitlement::new("user-1".to_string(), now);
        record.tier = SubscriptionTier::Monthly;
        record.status = SubscriptionStatus::Active;
        record.period_end = Some(now + Duration::days(30));
        record
    }

    #[test]
    fn lifetime_is_always_premium_equivalent() {
        let now = now();
        let mut record = UserEntitlement::new("user-1".to_string(), now);
        record.tier = SubscriptionTier::Lifetime;
        record.status = SubscriptionStatus::Canceled;
        record.period_end = Some(now - Duration::days(400));
        assert!(record.is_premium_equivalent(now));
    }

    #[test]
    fn active_subscription_within_period_is_premium() {
        let now = now();
        let record = active_monthly(now);
        assert!(record.is_premium_equivalent(now));

        let policy = QuotaPolicy::default();
        assert_eq!(record.quota_for(&policy, now), policy.premium_daily);
    }

    #[test]
    fn lapsed_or_canceled_subscription_falls_back_to_free() {
        let now = now();

        let mut lapsed = active_monthly(now);
        lapsed.period_end = Some(now - Duration::hours(1));
        assert!(!lapsed.is_premium_equivalent(now));

        let mut canceled = active_monthly(now);
        canceled.status = SubscriptionStatus::Canceled;
        assert!(!canceled.is_premium_equivalent(now));

        let policy = QuotaPolicy::default();
        assert_eq!(canceled.quota_for(&policy, now), policy.free_daily);
    }

    #[test]
    fn roll_over_is_idempotent() {
        let now = now();
        let mut record = UserEntitlement::new("user-1".to_string(), now);
        record.usage_today = 7;
        record.last_reset_date = now.date_naive().pred_opt().unwrap();

        assert!(record.roll_over(now.date_naive(), now));
        assert_eq!(record.usage_today, 0);
        assert_eq!(record.last_reset_date, now.date_naive());

        let snapshot = record.clone();
        assert!(!record.roll_over(now.date_naive(), now + Duration::seconds(5)));
        assert_eq!(record, snapshot);
    }

    #[test]
    fn noop_patch_does_not_bump_updated_at() {
        let now = now();
        let mut record = active_monthly(now);
        let patch = EntitlementPatch {
            tier: Some(SubscriptionTier::Monthly),
            status: Some(SubscriptionStatus::Active),
            period_end: record.period_end,
            ..Default::default()
        };

        let later = now + Duration::minutes(10);
        assert!(!record.apply_patch(&patch, later));
        assert_eq!(record.updated_at, now);

        let effective = EntitlementPatch {
            status: Some(SubscriptionStatus::Canceled),
            ..Default::default()
        };
        assert!(record.apply_patch(&effective, later));
        assert_eq!(record.updated_at, later);
    }

    #[test]
    fn find_by_customer_matches_reference() {
        let now = now();
        let mut state = EntitlementState::new();
        let mut record = UserEntitlement::new("user-1".to_string(), now);
        record.provider_customer_id = Some("cus_123".to_string());
        state.insert(record);
        state.insert(UserEntitlement::new("user-2".to_string(), now));

        assert_eq!(
            state.find_by_customer("cus_123").map(|r| r.user_id.as_str()),
            Some("user-1")
        );
        assert!(state.find_by_customer("cus_999").is_none());
    }
}

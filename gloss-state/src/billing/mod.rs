//! Billing module for subscription state and usage metering
//!
//! This module provides:
//! 1. Subscription tier and status modeling
//! 2. Daily quota policy and the usage meter
//! 3. Reconciliation of Stripe lifecycle events into the entitlement store

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub mod stripe;
pub mod usage;
pub mod webhook;

/// Product plan levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    /// Free tier with a small daily quota
    Free,
    /// Monthly recurring subscription
    Monthly,
    /// Annual recurring subscription
    Annual,
    /// One-time lifetime purchase
    Lifetime,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Free
    }
}

impl SubscriptionTier {
    /// Map a checkout plan name onto a tier. Unknown plans are rejected
    /// rather than guessed at.
    pub fn from_plan(plan: &str) -> Option<Self> {
        match plan {
            "monthly" => Some(Self::Monthly),
            "annual" | "yearly" => Some(Self::Annual),
            "lifetime" => Some(Self::Lifetime),
            _ => None,
        }
    }
}

/// Local mirror of the provider's subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active
    Active,
    /// Subscription is canceled
    Canceled,
    /// Payment is past due
    PastDue,
    /// Checkout started but payment never settled
    Incomplete,
    /// Subscription is in trial period
    Trialing,
    /// No subscription has ever existed for this user
    None,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::None
    }
}

impl SubscriptionStatus {
    /// Map the provider's status string to the local mirror. Only
    /// `active` grants premium-equivalent access; everything else
    /// resolves to the free quota.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "incomplete" | "incomplete_expired" => Self::Incomplete,
            _ => Self::Canceled,
        }
    }
}

/// Daily quota policy, overridable through configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Explanations per UTC day for free-tier users
    pub free_daily: u32,
    /// Explanations per UTC day for premium-equivalent users
    pub premium_daily: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            free_daily: 10,
            premium_daily: 500,
        }
    }
}

/// The next UTC midnight after `now`, when daily counters roll over.
pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or_else(|| now.date_naive());
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

//! Thin Stripe REST client.
//!
//! The reconciler only ever needs two lookups (customer, subscription)
//! and the HTTP layer three session calls, so this speaks the REST API
//! directly over reqwest instead of pulling in a full SDK surface.
//! Webhook signatures use Stripe's `t=<ts>,v1=<hmac>` scheme.

use axum::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::StateError;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Signatures older than this are rejected to blunt replay.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// The customer fields the reconciler cares about
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    pub id: String,
    pub email: Option<String>,
}

/// The subscription fields the reconciler cares about
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    pub id: String,
    pub status: String,
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionLink {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSessionLink {
    pub url: String,
}

/// Synchronous detail lookups against the billing provider. The
/// reconciler depends on this seam, not on the concrete client, so
/// tests can substitute a stub.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<CustomerDetails, StateError>;
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionDetails, StateError>;
}

pub struct StripeClient {
    client: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(secret_key: String, webhook_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key,
            webhook_secret,
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StateError> {
        self.client
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| StateError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| StateError::Upstream(e.to_string()))?
            .json::<T>()
            .await
            .map_err(|e| StateError::Upstream(e.to_string()))
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, StateError> {
        self.client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| StateError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| StateError::Upstream(e.to_string()))?
            .json::<T>()
            .await
            .map_err(|e| StateError::Upstream(e.to_string()))
    }

    pub async fn create_customer(
        &self,
        email: &str,
        user_id: &str,
    ) -> Result<CustomerDetails, StateError> {
        self.post_form(
            "/customers",
            &[("email", email), ("metadata[user_id]", user_id)],
        )
        .await
    }

    /// Create a hosted checkout session. Recurring plans use
    /// subscription mode; the lifetime plan is a one-time payment.
    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        recurring: bool,
        user_id: &str,
        plan: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSessionLink, StateError> {
        let mode = if recurring { "subscription" } else { "payment" };
        self.post_form(
            "/checkout/sessions",
            &[
                ("customer", customer_id),
                ("mode", mode),
                ("line_items[0][price]", price_id),
                ("line_items[0][quantity]", "1"),
                ("success_url", success_url),
                ("cancel_url", cancel_url),
                ("metadata[user_id]", user_id),
                ("metadata[plan]", plan),
            ],
        )
        .await
    }

    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSessionLink, StateError> {
        self.post_form(
            "/billing_portal/sessions",
            &[("customer", customer_id), ("return_url", return_url)],
        )
        .await
    }

    /// Verify the `stripe-signature` header against the raw payload.
    /// Returns Ok(false) for a well-formed but wrong or expired
    /// signature, Err for a header that cannot be parsed at all.
    pub fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<bool, StateError> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = value.parse().ok();
                }
                Some(("v1", value)) => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| StateError::InvalidEvent("signature header missing timestamp".into()))?;
        if candidates.is_empty() {
            return Err(StateError::InvalidEvent(
                "signature header missing v1 signature".into(),
            ));
        }

        let now = chrono::Utc::now().timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            log::warn!("webhook signature timestamp outside tolerance, rejecting");
            return Ok(false);
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|e| StateError::InvalidEvent(e.to_string()))?;
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        let computed = mac.finalize().into_bytes();

        let valid = candidates
            .iter()
            .any(|candidate| bool::from(computed.as_slice().ct_eq(candidate.as_slice())));
        Ok(valid)
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<CustomerDetails, StateError> {
        self.get_json(&format!("/customers/{}", customer_id)).await
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionDetails, StateError> {
        self.get_json(&format!("/subscriptions/{}", subscription_id))
            .await
    }
}

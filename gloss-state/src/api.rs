use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use gloss_config::GlossConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::billing::stripe::{BillingProvider, StripeClient};
use crate::billing::usage::{self, EntitlementView};
use crate::billing::webhook::{self, BillingEvent};
use crate::billing::{next_reset, QuotaPolicy, SubscriptionTier};
use crate::cache::{cache_key, ResponseCache};
use crate::datastore::DataStore;
use crate::entitlements::EntitlementPatch;
use crate::errors::StateError;
use crate::generator::ExplanationGenerator;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<DataStore>>,
    pub cache: ResponseCache,
    pub stripe: Arc<StripeClient>,
    pub provider: Arc<dyn BillingProvider>,
    pub generator: Arc<dyn ExplanationGenerator>,
    pub policy: QuotaPolicy,
    pub config: Arc<GlossConfig>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/subscription/:user_id", get(subscription_status))
        .route("/api/explain", post(explain))
        .route("/api/webhook", post(stripe_webhook))
        .route("/api/checkout/session", post(create_checkout_session))
        .route("/api/portal/session", post(create_portal_session))
        .route("/api/admin/reset-usage", post(reset_usage))
        .with_state(state)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    cache_entries: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let version = option_env!("CARGO_PKG_VERSION").map(String::from);

    Json(HealthResponse {
        status: HealthStatus::Healthy,
        version,
        cache_entries: state.cache.len(),
    })
}

/// Read path: tier, today's usage and remaining allowance. Applies the
/// daily rollover but never consumes a unit.
async fn subscription_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<EntitlementView>, StateError> {
    let view = usage::resolve(state.store.clone(), &user_id, &state.policy).await?;
    Ok(Json(view))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainRequest {
    pub user_id: String,
    pub symbol: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// The metered operation: quota check, cache lookup, generator on a
/// miss. A unit is committed for cache hits and successful generations
/// only; a generator failure leaves the counter untouched.
async fn explain(
    State(state): State<AppState>,
    Json(request): Json<ExplainRequest>,
) -> Result<Response, StateError> {
    if request.user_id.trim().is_empty() || request.symbol.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "user_id and symbol are required"
            })),
        )
            .into_response());
    }

    let decision = usage::check_quota(state.store.clone(), &request.user_id, &state.policy).await?;
    if !decision.allowed {
        log::info!(
            "declining explain for user {}: daily limit {} reached ({:?} tier)",
            request.user_id,
            decision.limit,
            decision.tier
        );
        return Err(StateError::QuotaExceeded {
            limit: decision.limit,
            reset_at: next_reset(Utc::now()),
        });
    }

    let key = cache_key(&request.symbol, request.context.as_deref());
    if let Some(hit) = state.cache.get(&key) {
        let remaining =
            usage::commit_usage(state.store.clone(), &request.user_id, &state.policy).await?;
        log::info!("cache hit for symbol {:?}", request.symbol);
        return Ok(Json(explain_body(&hit, true, remaining)).into_response());
    }

    let explanation = state
        .generator
        .generate(&request.symbol, request.context.as_deref())
        .await?;
    state.cache.insert(key, explanation.clone());

    let remaining =
        usage::commit_usage(state.store.clone(), &request.user_id, &state.policy).await?;
    Ok(Json(explain_body(&explanation, false, remaining)).into_response())
}

fn explain_body(
    explanation: &crate::generator::Explanation,
    cached: bool,
    remaining: u32,
) -> serde_json::Value {
    json!({
        "symbol": explanation.symbol,
        "explanation": explanation.explanation,
        "category": explanation.category,
        "timestamp": explanation.timestamp.to_rfc3339(),
        "cached": cached,
        "remaining_today": remaining
    })
}

/// Webhook intake. The raw body is needed for signature verification,
/// so this route must see the request before any JSON extraction.
/// Semantic failures (unknown customer, unrecognized plan) are logged
/// and acknowledged: the provider's retry loop cannot repair them.
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
    {
        Some(signature) => signature.to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "missing stripe-signature header"})),
            )
                .into_response()
        }
    };

    match state.stripe.verify_webhook_signature(&body, &signature) {
        Ok(true) => {}
        Ok(false) => {
            log::warn!("webhook signature verification failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid signature"})),
            )
                .into_response();
        }
        Err(e) => {
            log::warn!("unparseable stripe-signature header: {}", e);
            return e.into_response();
        }
    }

    let event = match webhook::parse_event(&body) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("dropping malformed webhook event: {}", e);
            return (StatusCode::OK, Json(json!({"received": true}))).into_response();
        }
    };

    let outcome = match event {
        BillingEvent::CheckoutCompleted(session) => {
            webhook::apply_checkout_completed(state.store.clone(), state.provider.as_ref(), session)
                .await
                .map(|_| ())
        }
        BillingEvent::SubscriptionChanged(update) => {
            webhook::apply_subscription_changed(state.store.clone(), update)
                .await
                .map(|_| ())
        }
        BillingEvent::Ignored { event_type } => {
            log::info!("unhandled event type {}", event_type);
            Ok(())
        }
    };

    match outcome {
        Ok(()) => (StatusCode::OK, Json(json!({"received": true}))).into_response(),
        Err(StateError::NotFound(what)) => {
            log::warn!("webhook referenced unknown record: {}", what);
            (StatusCode::OK, Json(json!({"received": true}))).into_response()
        }
        Err(StateError::InvalidEvent(msg)) => {
            log::warn!("dropping semantically invalid event: {}", msg);
            (StatusCode::OK, Json(json!({"received": true}))).into_response()
        }
        Err(e) => {
            log::error!("webhook handler failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "webhook handler failed"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionRequest {
    pub user_id: String,
    pub plan: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Start a hosted checkout. A saved customer reference is re-verified
/// against the provider first; a stale one (test/live mode switch) is
/// discarded and replaced.
async fn create_checkout_session(
    State(state): State<AppState>,
    Json(request): Json<CheckoutSessionRequest>,
) -> Result<Response, StateError> {
    let tier = SubscriptionTier::from_plan(&request.plan).ok_or_else(|| {
        StateError::InvalidEvent(format!("unknown plan {:?}", request.plan))
    })?;

    let price_id = match price_id_for(&state.config, tier) {
        Some(price_id) => price_id,
        None => {
            log::error!("no price id configured for plan {}", request.plan);
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": format!("Price not configured for {} plan", request.plan)
                })),
            )
                .into_response());
        }
    };

    let now = Utc::now();
    let email = request
        .email
        .clone()
        .unwrap_or_else(|| format!("user_{}@pending.glossmath.app", request.user_id));

    let saved_customer = {
        let mut datastore = state.store.lock().await;
        let record = datastore.get_or_create(&request.user_id, now)?;
        record.provider_customer_id
    };

    let verified_customer = match saved_customer {
        Some(customer_id) => match state.provider.retrieve_customer(&customer_id).await {
            Ok(customer) => Some(customer.id),
            Err(e) => {
                log::warn!(
                    "saved customer {} not recognized by provider ({}), creating a new one",
                    customer_id,
                    e
                );
                let mut datastore = state.store.lock().await;
                datastore.clear_provider_customer(&request.user_id, now)?;
                None
            }
        },
        None => None,
    };

    let customer_id = match verified_customer {
        Some(customer_id) => customer_id,
        None => {
            let customer = state.stripe.create_customer(&email, &request.user_id).await?;
            let mut datastore = state.store.lock().await;
            datastore.apply_patch_by_user(
                &request.user_id,
                &EntitlementPatch {
                    provider_customer_id: Some(customer.id.clone()),
                    ..Default::default()
                },
                now,
            )?;
            customer.id
        }
    };

    let success_url = format!(
        "{}/success?session_id={{CHECKOUT_SESSION_ID}}",
        state.config.base_url
    );
    let cancel_url = format!("{}/cancel", state.config.base_url);

    let session = state
        .stripe
        .create_checkout_session(
            &customer_id,
            &price_id,
            tier != SubscriptionTier::Lifetime,
            &request.user_id,
            &request.plan,
            &success_url,
            &cancel_url,
        )
        .await?;

    log::info!(
        "checkout session {} created for user {} ({} plan)",
        session.id,
        request.user_id,
        request.plan
    );
    Ok(Json(json!({"session_id": session.id, "url": session.url})).into_response())
}

fn price_id_for(config: &GlossConfig, tier: SubscriptionTier) -> Option<String> {
    match tier {
        SubscriptionTier::Monthly => config.stripe_monthly_price_id.clone(),
        SubscriptionTier::Annual => config.stripe_annual_price_id.clone(),
        SubscriptionTier::Lifetime => config.stripe_lifetime_price_id.clone(),
        SubscriptionTier::Free => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSessionRequest {
    pub user_id: String,
}

async fn create_portal_session(
    State(state): State<AppState>,
    Json(request): Json<PortalSessionRequest>,
) -> Result<Response, StateError> {
    let customer_id = {
        let datastore = state.store.lock().await;
        datastore
            .get(&request.user_id)
            .and_then(|record| record.provider_customer_id.clone())
    }
    .ok_or_else(|| {
        StateError::NotFound(format!("billing customer for user {}", request.user_id))
    })?;

    let session = state
        .stripe
        .create_portal_session(&customer_id, &state.config.base_url)
        .await?;
    Ok(Json(json!({"url": session.url})).into_response())
}

/// Maintenance hook: zero every usage counter.
async fn reset_usage(State(state): State<AppState>) -> Result<Response, StateError> {
    let count = {
        let mut datastore = state.store.lock().await;
        datastore.reset_all_usage(Utc::now())?
    };
    log::info!("reset usage for {} record(s)", count);
    Ok(Json(json!({"success": true, "reset_count": count})).into_response())
}

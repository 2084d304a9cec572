use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gloss_config::GlossConfig;
use gloss_state::api::{self, AppState};
use gloss_state::billing::stripe::StripeClient;
use gloss_state::billing::QuotaPolicy;
use gloss_state::cache::ResponseCache;
use gloss_state::datastore::DataStore;
use gloss_state::generator::OpenAiGenerator;
use tokio::sync::Mutex;

#[derive(Clone, Debug, Parser)]
pub struct Cli {
    #[clap(long, short, alias = "config", default_value_os_t = PathBuf::from("/etc/gloss/config.json"))]
    config_path: PathBuf,
    #[clap(long, short)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    simple_logger::init_with_level(log::Level::Info)?;

    let cli = Cli::parse();
    let config = GlossConfig::load(&cli.config_path)?;
    let port = cli.port.unwrap_or(config.listen_port);

    if config.stripe_secret_key.is_none() {
        log::warn!("STRIPE_SECRET_KEY not configured; billing endpoints will fail");
    }
    if config.openai_api_key.is_none() {
        log::warn!("OPENAI_API_KEY not configured; explanation generation will fail");
    }

    let store = Arc::new(Mutex::new(DataStore::open(&config.db_path)?));
    let stripe = Arc::new(StripeClient::new(
        config.stripe_secret_key.clone().unwrap_or_default(),
        config.stripe_webhook_secret.clone().unwrap_or_default(),
    ));
    let generator = Arc::new(OpenAiGenerator::new(
        config.openai_api_key.clone().unwrap_or_default(),
        config.openai_model.clone(),
    ));

    let state = AppState {
        store,
        cache: ResponseCache::new(Duration::from_secs(config.cache_ttl_secs)),
        provider: stripe.clone(),
        stripe,
        generator,
        policy: QuotaPolicy {
            free_daily: config.free_daily_limit,
            premium_daily: config.premium_daily_limit,
        },
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    log::info!("gloss-state listening on {}", listener.local_addr()?);
    axum::serve(listener, api::app(state)).await?;

    Ok(())
}

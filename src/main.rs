//! Mirrorbot: multi-tenant copy-trading and arbitrage backend for a
//! binary-outcome prediction market.

use anyhow::{Context, Result};
use axum::{
    middleware as axum_mw,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirrorbot_backend::{
    api::{self, AppState},
    auth::{auth_middleware, siwe, JwtHandler},
    engines::Supervisor,
    gateway::PolymarketGateway,
    models::{Config, WsServerEvent},
    notify::TelegramNotifier,
    store::Store,
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirrorbot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve the operator's address and seed owner-scoped rows.
async fn bootstrap_owner(config: &Config, store: &Store) -> Result<Option<String>> {
    let owner = match siwe::derive_owner_address(&config.private_key) {
        Ok(address) => address,
        Err(e) => {
            warn!(
                "Could not derive owner address ({e}). \
                 Owner-gated endpoints will be unavailable until a private key is configured."
            );
            return Ok(None);
        }
    };

    store.upsert_user(&owner, "owner").await?;
    store.claim_legacy_data(&owner).await?;
    store.add_whitelist(&owner, "system").await?;
    info!("👑 Owner address: {owner}");

    if !config.seed_traders.is_empty() {
        let added = store.seed_traders(&owner, &config.seed_traders).await?;
        if added > 0 {
            info!("🌱 Seeded {added} followed traders from environment");
        }
    }
    Ok(Some(owner))
}

fn build_router(state: AppState, jwt: Arc<JwtHandler>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(api::status::health))
        .route("/api/auth/nonce", post(api::auth_routes::nonce))
        .route("/api/auth/verify", post(api::auth_routes::verify))
        .route("/api/auth/session", get(api::auth_routes::session))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/status", get(api::status::status))
        // Copy trading
        .route("/api/copy/start", post(api::copy::start))
        .route("/api/copy/stop", post(api::copy::stop))
        .route(
            "/api/copy/traders",
            get(api::copy::list_traders).post(api::copy::add_trader),
        )
        .route(
            "/api/copy/traders/:address",
            delete(api::copy::remove_trader).patch(api::copy::update_trader),
        )
        .route("/api/copy/traders/:address/profile", get(api::copy::trader_profile))
        .route("/api/copy/trades", get(api::copy::trades))
        .route("/api/copy/stats", get(api::copy::stats))
        .route("/api/copy/pnl", get(api::copy::pnl))
        // Arbitrage
        .route("/api/arb/start", post(api::arb::start))
        .route("/api/arb/stop", post(api::arb::stop))
        .route("/api/arb/trades", get(api::arb::trades))
        .route("/api/arb/stats", get(api::arb::stats))
        .route("/api/arb/pnl", get(api::arb::pnl))
        // Positions
        .route("/api/positions", get(api::positions_routes::list))
        .route("/api/positions/summary", get(api::positions_routes::summary))
        .route("/api/positions/closed", get(api::positions_routes::closed))
        .route("/api/positions/close-all", post(api::positions_routes::close_all))
        .route("/api/positions/redeem-all", post(api::positions_routes::redeem_all))
        // Funds
        .route("/api/funds", get(api::funds::list).post(api::funds::create))
        .route("/api/funds/my-investments", get(api::funds::my_investments))
        .route("/api/funds/engine/start", post(api::funds::engine_start))
        .route("/api/funds/engine/stop", post(api::funds::engine_stop))
        .route(
            "/api/funds/investments/:id/withdraw",
            post(api::funds::withdraw),
        )
        .route("/api/funds/:id", get(api::funds::get).patch(api::funds::update))
        .route("/api/funds/:id/allocations", put(api::funds::set_allocations))
        .route("/api/funds/:id/invest", post(api::funds::invest))
        .route("/api/funds/:id/performance", get(api::funds::performance))
        .route("/api/funds/:id/trades", get(api::funds::trades))
        // Whitelist (owner)
        .route(
            "/api/whitelist",
            get(api::whitelist::list).post(api::whitelist::add),
        )
        .route(
            "/api/whitelist/settings",
            get(api::whitelist::settings).patch(api::whitelist::update_settings),
        )
        .route("/api/whitelist/:address", delete(api::whitelist::remove))
        // Account
        .route("/api/me", get(api::account::me))
        .route("/api/trades", get(api::account::trades))
        .route("/api/events", get(api::account::events))
        .route(
            "/api/preferences",
            get(api::account::get_preferences).patch(api::account::patch_preferences),
        )
        .route(
            "/api/credentials",
            get(api::account::get_credentials)
                .put(api::account::put_credentials)
                .delete(api::account::delete_credentials),
        )
        // WebSocket status stream
        .route("/ws", get(api::ws::handler))
        .route_layer(axum_mw::from_fn_with_state(jwt, auth_middleware))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env();
    info!("🚀 Mirrorbot backend starting");

    let store = Store::new(&config.db_path).context("open store")?;
    info!("📊 Database initialized at: {}", config.db_path);

    let owner_address = bootstrap_owner(&config, &store).await?;

    let gateway = PolymarketGateway::new(&config).context("build market gateway")?;
    let notifier_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build notifier client")?;
    let notifier = TelegramNotifier::new(&config, notifier_client);

    let (events, _) = broadcast::channel::<WsServerEvent>(1000);
    let supervisor = Supervisor::new(events.clone());
    let jwt = Arc::new(JwtHandler::new(
        config.jwt_secret.clone(),
        config.jwt_expiry_hours,
    ));

    let port = config.port;
    let state = AppState {
        config: Arc::new(config),
        store: store.clone(),
        supervisor,
        gateway,
        notifier,
        jwt: jwt.clone(),
        owner_address,
        whitelist_enabled: Arc::new(AtomicBool::new(true)),
        events,
    };

    // The price tracker serves read-only P&L even before any engine starts.
    api::positions_routes::ensure_position_tracker(&state);

    // Hourly cleanup of expired and abandoned auth sessions.
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                match store.cleanup_expired_sessions().await {
                    Ok(0) => {}
                    Ok(n) => info!("🧹 Pruned {n} expired auth sessions"),
                    Err(e) => warn!(error = %e, "session cleanup failed"),
                }
            }
        });
    }

    let app = build_router(state, jwt);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

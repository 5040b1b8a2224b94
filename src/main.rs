use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use paymentd_rs::config::Config;
use paymentd_rs::context::ServiceContext;
use paymentd_rs::db;
use paymentd_rs::drivers::fritzpay::FritzpayDriver;
use paymentd_rs::drivers::DriverRegistry;
use paymentd_rs::nonce::NonceCache;
use paymentd_rs::routes::{self, AppState};
use paymentd_rs::services::payment_service::PaymentService;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting paymentd...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        "Configuration loaded: host={}, port={}",
        config.host,
        config.port
    );

    tracing::info!("Connecting to payment database...");
    let payment_pool = db::create_pool(&config.payment_database_url)
        .await
        .expect("Failed to connect to payment database");
    let payment_ro_pool = match &config.payment_database_ro_url {
        Some(url) => Some(
            db::create_pool(url)
                .await
                .expect("Failed to connect to payment read-only database"),
        ),
        None => None,
    };

    tracing::info!("Connecting to principal database...");
    let principal_pool = db::create_pool(&config.principal_database_url)
        .await
        .expect("Failed to connect to principal database");
    let principal_ro_pool = match &config.principal_database_ro_url {
        Some(url) => Some(
            db::create_pool(url)
                .await
                .expect("Failed to connect to principal read-only database"),
        ),
        None => None,
    };

    tracing::info!("Running migrations...");
    db::run_payment_migrations(&payment_pool)
        .await
        .expect("Failed to run payment migrations");
    db::run_principal_migrations(&principal_pool)
        .await
        .expect("Failed to run principal migrations");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(
        ServiceContext::new(
            config.clone(),
            payment_pool,
            payment_ro_pool,
            principal_pool,
            principal_ro_pool,
            shutdown_rx,
        )
        .expect("Failed to build service context"),
    );

    let service = PaymentService::new(ctx.clone())
        .await
        .expect("Failed to initialize payment service");

    // PSP drivers mount under /<provider-name>
    let mut registry = DriverRegistry::new();
    let fritzpay = FritzpayDriver::new(ctx.clone(), service.clone());
    let fritzpay_routes = registry
        .attach(&ctx, fritzpay)
        .await
        .expect("Failed to attach fritzpay driver");

    let state = AppState {
        ctx: ctx.clone(),
        service,
        registry: Arc::new(registry),
        nonce_cache: Arc::new(NonceCache::new(Duration::from_secs(
            config.auth_timestamp_skew_secs.unsigned_abs(),
        ))),
    };

    let app = routes::router(state).merge(fritzpay_routes).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr = SocketAddr::from((
        config
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0])),
        config.port,
    ));
    tracing::info!("paymentd listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown requested, draining...");
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("Server failed to start");

    // drain window for detached notifier and driver tasks
    tokio::time::sleep(Duration::from_millis(500)).await;

    tracing::info!("paymentd stopped");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install shutdown signal handler");
}

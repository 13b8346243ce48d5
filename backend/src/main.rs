use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use care_marketplace::{
    billing::{BillingService, HttpSubscriptionLookup, PgBillingStore, WebhookVerifier},
    config,
    messaging::MessageHub,
    notifications::mailer_from_config,
    root,
    routes::api_routes,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if either secret is missing
    let _ = config::STRIPE_WEBHOOK_SECRET.as_str();
    let _ = config::AUTH_JWT_SECRET.as_str();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let mut billing = BillingService::new(Arc::new(PgBillingStore::new(pool.clone())));
    match HttpSubscriptionLookup::from_config() {
        Some(lookup) => billing = billing.with_subscription_lookup(Arc::new(lookup)),
        None => tracing::warn!(
            "STRIPE_SECRET_KEY unset; id-only checkouts wait for subscription events"
        ),
    }
    let verifier = WebhookVerifier::from_config();
    let hub = MessageHub::new();
    let mailer = mailer_from_config();

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(billing))
        .layer(Extension(verifier))
        .layer(Extension(hub))
        .layer(Extension(mailer));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

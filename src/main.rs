use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use boxoffice_server::clock::SystemClock;
use boxoffice_server::config::Config;
use boxoffice_server::routes::{create_routes, AppState};
use boxoffice_server::store::{MemoryStore, PgStore, Store};
use boxoffice_server::ticketing::{
    Boxoffice, CallbackSigner, HmacQrCodec, HostedCheckout, LogNotifier, Services,
};

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Successfully connected to database");

            sqlx::migrate!()
                .run(&pool)
                .await
                .expect("Failed to run migrations");
            tracing::info!("Migrations run successfully");

            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let services = Services {
        clock: Arc::new(SystemClock),
        codec: Arc::new(
            HmacQrCodec::new(&config.qr_signing_secret).expect("QR signing secret is unusable"),
        ),
        payments: Arc::new(HostedCheckout::new(config.checkout_base_url.clone())),
        notifier: Arc::new(LogNotifier),
    };
    let boxoffice = Boxoffice::new(store, services, config.ticketing);

    spawn_sweeper(boxoffice.clone(), config.sweep_interval);

    let callbacks = CallbackSigner::new(&config.payment_webhook_secret)
        .expect("Payment webhook secret is unusable");
    let app: Router = create_routes(AppState { boxoffice, callbacks }, &config.http);

    tracing::info!("Server running at http://{}", config.bind_addr);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server failed");
}

/// Releases lapsed holds in the background so inventory comes back even
/// when nobody reads the affected orders.
fn spawn_sweeper(boxoffice: Boxoffice, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(std::time::Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = boxoffice.sweep_expired().await {
                tracing::error!(error = %e, "Hold sweep failed");
            }
        }
    });
}

//! Relay Producer - web form that publishes messages to the queue.
//!
//! This binary:
//! - Serves the submission form on `GET /`
//! - Publishes `messageQuantity` copies of `messageText` on `POST /post`
//! - Shuts down gracefully on SIGINT/SIGTERM, closing the channel before the
//!   connection

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::supervisor::cancel_on_signal;
use relay::web::{producer_router, AppState};
use relay::{AmqpConnector, Config, HttpService, Role, Services, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("producer_starting");

    // Load configuration
    let config = Config::from_env(Role::Producer).context("Invalid configuration")?;
    info!(
        port = config.port,
        broker = %config.dial_target,
        queue = %config.queue_name,
        max_messages = ?config.max_messages,
        "config_loaded"
    );

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let supervisor = Supervisor::start(
        &AmqpConnector::new("relay-producer"),
        &config.dial_target,
        &config.queue_name,
    )
    .await
    .context("Failed to start producer")?;

    // Bind only once the broker side is ready
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            supervisor.close().await;
            return Err(e).context("Failed to bind to address");
        }
    };

    // Create application state
    let state = AppState::new(supervisor.publisher(), config.max_messages);

    let services = Services {
        http: Some(HttpService {
            listener,
            router: producer_router(state),
        }),
        consumer: None,
    };

    // Run server with graceful shutdown
    supervisor
        .run(services, shutdown)
        .await
        .context("Server error")?;

    info!("producer_shutdown_complete");

    Ok(())
}

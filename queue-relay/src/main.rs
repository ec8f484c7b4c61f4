//! Relay Consumer - long-running queue consumer.
//!
//! Consumes the configured queue and logs every delivery, while serving
//! `/health` on `PORT`. Both run as independent tasks until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::supervisor::cancel_on_signal;
use relay::{
    web, AmqpConnector, Config, ConsumerService, HttpService, LogSink, Role, Services, Supervisor,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("consumer_starting");

    // Load configuration from environment
    let config = Config::from_env(Role::Consumer).context("Invalid configuration")?;
    info!(
        port = config.port,
        broker = %config.dial_target,
        queue = %config.queue_name,
        resubscribe_attempts = config.resubscribe.attempts,
        resubscribe_delay_ms = config.resubscribe.delay.as_millis() as u64,
        "config_loaded"
    );

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let supervisor = Supervisor::start(
        &AmqpConnector::new("relay-consumer"),
        &config.dial_target,
        &config.queue_name,
    )
    .await
    .context("Failed to start consumer")?;

    // Bind only once the broker side is ready
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            supervisor.close().await;
            return Err(e).context("Failed to bind to address");
        }
    };

    let services = Services {
        http: Some(HttpService {
            listener,
            router: web::consumer_router(),
        }),
        consumer: Some(ConsumerService {
            sink: Arc::new(LogSink),
            policy: config.resubscribe,
        }),
    };

    supervisor
        .run(services, shutdown)
        .await
        .context("Consumer stopped with an error")?;

    info!("consumer_shutdown_complete");

    Ok(())
}

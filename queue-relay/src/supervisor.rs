//! Service supervisor.
//!
//! Drives the process through
//! `Init → Connected → ChannelOpen → QueueDeclared → Running → ShuttingDown → Terminated`.
//!
//! Startup failures come back to the caller as [`StartupError`] with anything
//! acquired so far released. Once running, the HTTP surface and the consumer
//! loop are separate tasks sharing one [`CancellationToken`]. Either task
//! ending, for any reason, cancels the token so the other stops too. Shutdown
//! then joins both tasks and closes the channel before the connection.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{BrokerChannel, BrokerConnection, Connector};
use crate::config::DialTarget;
use crate::consumer::{self, DeliverySink, ResubscribePolicy};
use crate::error::{StartupError, SupervisorError};
use crate::queue::{Publisher, Queue, QueueProperties};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Connected,
    ChannelOpen,
    QueueDeclared,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Init => "init",
            SupervisorState::Connected => "connected",
            SupervisorState::ChannelOpen => "channel_open",
            SupervisorState::QueueDeclared => "queue_declared",
            SupervisorState::Running => "running",
            SupervisorState::ShuttingDown => "shutting_down",
            SupervisorState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// HTTP surface served while running.
pub struct HttpService {
    pub listener: TcpListener,
    pub router: Router,
}

/// Consumer loop run while running.
pub struct ConsumerService {
    pub sink: Arc<dyn DeliverySink>,
    pub policy: ResubscribePolicy,
}

/// The tasks to start once the queue is declared.
#[derive(Default)]
pub struct Services {
    pub http: Option<HttpService>,
    pub consumer: Option<ConsumerService>,
}

pub struct Supervisor {
    state: SupervisorState,
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    queue: Queue,
}

impl Supervisor {
    /// Connect, open a channel and declare `queue_name`.
    pub async fn start(
        connector: &dyn Connector,
        target: &DialTarget,
        queue_name: &str,
    ) -> Result<Self, StartupError> {
        log_transition(SupervisorState::Init);

        let connection = connector.connect(target).await.map_err(|e| {
            error!(broker = %target, error = %e, "broker_connect_failed");
            e
        })?;
        log_transition(SupervisorState::Connected);

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "channel_open_failed");
                close_connection(connection.as_ref()).await;
                return Err(e.into());
            }
        };
        log_transition(SupervisorState::ChannelOpen);

        let queue = match channel
            .declare_queue(queue_name, QueueProperties::TRANSIENT)
            .await
        {
            Ok(queue) => queue,
            Err(e) => {
                error!(queue = %queue_name, error = %e, "queue_declare_failed");
                close_channel(channel.as_ref()).await;
                close_connection(connection.as_ref()).await;
                return Err(e.into());
            }
        };
        log_transition(SupervisorState::QueueDeclared);

        Ok(Self {
            state: SupervisorState::QueueDeclared,
            connection,
            channel,
            queue,
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Publisher bound to the supervisor's channel and queue.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.channel), self.queue.clone())
    }

    /// Run `services` until `shutdown` fires or one of them stops, then tear
    /// everything down in reverse order of acquisition.
    pub async fn run(
        mut self,
        services: Services,
        shutdown: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let http_task = services.http.map(|http| {
            let token = shutdown.clone();
            spawn_linked(&shutdown, async move {
                let addr = http.listener.local_addr().ok();
                info!(address = ?addr, "http_listening");
                axum::serve(http.listener, http.router)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            })
        });

        let consumer_task = services.consumer.map(|service| {
            let token = shutdown.clone();
            let channel = Arc::clone(&self.channel);
            let queue = self.queue.clone();
            spawn_linked(&shutdown, async move {
                consumer::run(channel, queue, service.sink, service.policy, token).await
            })
        });

        self.transition(SupervisorState::Running);

        shutdown.cancelled().await;
        self.transition(SupervisorState::ShuttingDown);

        let mut outcome: Result<(), SupervisorError> = Ok(());

        if let Some(result) = join("consumer", consumer_task).await {
            match result {
                Ok(Ok(received)) => info!(received = received, "consumer_stopped"),
                Ok(Err(e)) => outcome = outcome.and(Err(e.into())),
                Err(e) => outcome = outcome.and(Err(e)),
            }
        }

        if let Some(result) = join("http", http_task).await {
            match result {
                Ok(Ok(())) => info!("http_stopped"),
                Ok(Err(e)) => outcome = outcome.and(Err(e.into())),
                Err(e) => outcome = outcome.and(Err(e)),
            }
        }

        self.release().await;

        if let Err(e) = &outcome {
            error!(error = %e, "supervisor_stopped_with_error");
        }
        outcome
    }

    /// Release the channel and connection without running any services.
    pub async fn close(mut self) {
        self.transition(SupervisorState::ShuttingDown);
        self.release().await;
    }

    async fn release(&mut self) {
        close_channel(self.channel.as_ref()).await;
        close_connection(self.connection.as_ref()).await;
        self.transition(SupervisorState::Terminated);
    }

    fn transition(&mut self, next: SupervisorState) {
        self.state = next;
        log_transition(next);
    }
}

fn log_transition(state: SupervisorState) {
    info!(state = %state, "supervisor_state");
}

/// Spawn `task` so that it cancels `token` when it ends, whether it returns
/// or panics.
fn spawn_linked<F>(token: &CancellationToken, task: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let stop_others = token.clone().drop_guard();
    tokio::spawn(async move {
        let _stop_others = stop_others;
        task.await
    })
}

async fn join<T>(
    task: &'static str,
    handle: Option<JoinHandle<T>>,
) -> Option<Result<T, SupervisorError>> {
    let handle = handle?;
    Some(handle.await.map_err(|e| SupervisorError::Task {
        task,
        reason: e.to_string(),
    }))
}

async fn close_channel(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close().await {
        warn!(error = %e, "channel_close_error");
    }
}

async fn close_connection(connection: &dyn BrokerConnection) {
    if let Err(e) = connection.close().await {
        warn!(error = %e, "connection_close_error");
    }
}

/// Completes when SIGINT or SIGTERM is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Cancel `shutdown` when a termination signal arrives.
pub fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => shutdown.cancel(),
            _ = shutdown.cancelled() => {}
        }
    });
}

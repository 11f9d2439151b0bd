use std::sync::Arc;

use config::Config;
use pipeline::{CriticalError, MessageHandler};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod address;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod delayed;
pub mod dispatch;
pub mod error;
pub mod expiry;
pub mod failure;
pub mod message;
pub mod pipeline;
pub mod receive;
pub mod service;
pub mod subscription;
pub mod transaction;

/// Installs the global subscriber. The filter is read from `TABLEMQ_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TABLEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TABLEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}

/// Returns a builder for an endpoint that processes its input queue with `handler` until
/// Ctrl-C or a critical error.
#[bon::builder(finish_fn = start)]
pub async fn run<H>(handler: H, config: Option<Config>) -> eyre::Result<()>
where
    H: MessageHandler,
{
    init_tracing()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let shutdown = CancellationToken::new();

    let service = service::Service::connect_with(config)
        .await?
        .with_critical_error({
            let shutdown = shutdown.clone();
            Arc::new(move |e: CriticalError| {
                tracing::error!(error = %e.error(), "{}", e.message());
                shutdown.cancel();
            })
        });

    let delayed = service.start_delayed_delivery(shutdown.child_token());

    let mut receiver = service.receiver();
    receiver
        .initialize(Arc::new(handler), Arc::new(service.immediate_retries()))
        .await?;
    receiver.start_receive()?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down");
        }
        _ = shutdown.cancelled() => {
            tracing::warn!("Shutting down after a critical error");
        }
    }

    receiver.stop_receive().await?;

    shutdown.cancel();
    if let Some(delayed) = delayed {
        delayed.await?;
    }

    Ok(())
}

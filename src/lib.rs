use config::Config;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod utils;

/// Returns a builder for the main application.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SQLOJ_LOG")
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
                .with_env_var("SQLOJ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = service::Service::connect_with(config).await?;

    service.provision().await?;

    let cancel = CancellationToken::new();

    let pool = tokio::spawn(service.dispatch_pool().run(cancel.clone()));
    let reclaimer = tokio::spawn(service.reclaimer().run(cancel.clone()));

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    cancel.cancel();

    pool.await?;
    reclaimer.await?;

    Ok(())
}

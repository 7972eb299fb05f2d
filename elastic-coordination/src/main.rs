use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use elastic_coordination::client::EtcdClient;
use elastic_coordination::config::Config;
use elastic_coordination::manager::ElasticManager;
use elastic_coordination::publish::PublishedRoster;
use elastic_coordination::util::{self, Backoff};

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
    Ok(())
}

async fn hand_off(published: &PublishedRoster, path: Option<&Path>) -> anyhow::Result<()> {
    tracing::info!(
        trainers = %published.trainers,
        trainer_id = ?published.trainer_id,
        "publishing roster"
    );
    match path {
        Some(path) => published
            .write_to(path)
            .await
            .with_context(|| format!("failed to write roster to {}", path.display())),
        None => {
            print!("{}", published.render());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    let elastic = config
        .elastic_config()
        .context("invalid elastic configuration")?;
    let roster_path = elastic.roster_path.clone();

    tracing::info!("Starting elastic-agent");
    tracing::info!("Job: {}", elastic.job_id);
    tracing::info!("Coordination service: {}", config.elastic_server);
    tracing::info!("Backend: {}", elastic.backend);

    let manager = if elastic.enabled() {
        let endpoints = elastic.endpoints.clone();
        let client = util::retry_with_backoff(
            "connect to etcd",
            Backoff::default(),
            &CancellationToken::new(),
            || EtcdClient::connect(&endpoints),
        )
        .await
        .context("failed to connect to etcd")?;
        ElasticManager::new(elastic, Arc::new(client)).await?
    } else {
        ElasticManager::disabled(elastic)
    };

    if let Err(e) = manager.start().await {
        manager.exit(false).await;
        return Err(e).context("failed to start elastic manager");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let ready = tokio::select! {
        ready = manager.wait_ready() => ready,
        shutdown_result = &mut shutdown => {
            manager.exit(false).await;
            return shutdown_result;
        }
    };
    let published = match ready {
        Ok(published) => published,
        Err(e) => {
            manager.exit(false).await;
            return Err(e).context("membership did not become ready");
        }
    };
    hand_off(&published, roster_path.as_deref()).await?;

    let mut updates = manager.published();
    updates.mark_unchanged();
    loop {
        tokio::select! {
            shutdown_result = &mut shutdown => {
                if let Err(e) = shutdown_result {
                    tracing::error!(error = %e, "shutdown signal handling failed");
                }
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let published = updates.borrow_and_update().clone();
                if let Err(e) = hand_off(&published, roster_path.as_deref()).await {
                    tracing::error!(error = %e, "failed to hand off roster update");
                }
            }
        }
    }

    manager.exit(false).await;
    Ok(())
}

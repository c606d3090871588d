#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use media_node::config::Config;
use media_node::engine::mediasoup::MediasoupEngine;
use media_node::load::{LoadManager, SystemNetworks};
use media_node::media::WorkerManager;
use media_node::node::MediaNode;
use media_node::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_node=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    info!("Media node - Starting [workers: {}]", config.workers);

    let media_config = Arc::new(config.to_media_config());
    let workers = WorkerManager::start(Arc::new(MediasoupEngine::new()), media_config).await?;

    let load = LoadManager::new(workers.clone(), Box::new(SystemNetworks::new()), config.available_bandwidth());
    load.start(config.load_polling_interval());

    let node = MediaNode::new(workers, load);
    info!("Worker pool and load manager initialized");

    let signaling_server = SignalingServer::new(node.clone(), config.secret.clone());

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.host, config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = drain_signals(&node, &config) => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down...");
        }
    }

    node.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// SIGUSR1 starts a drain and SIGUSR2 cancels it. Never resolves.
#[cfg(unix)]
async fn drain_signals(node: &MediaNode, config: &Config) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut drain, mut cancel) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(drain), Ok(cancel)) => (drain, cancel),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Failed to install drain signal handlers: {}", e);
            return std::future::pending().await;
        }
    };

    loop {
        tokio::select! {
            _ = drain.recv() => node.drain(config.drain_timeout()),
            _ = cancel.recv() => {
                node.cancel_drain();
            }
        }
    }
}

#[cfg(not(unix))]
async fn drain_signals(_node: &MediaNode, _config: &Config) {
    std::future::pending().await
}

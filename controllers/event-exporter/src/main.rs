//! Event Exporter
//!
//! Watches Kubernetes Events and writes the ones selected by the configured
//! allow-lists to stdout, one JSON object per line:
//! - `--types`: event type (`Normal`, `Warning`, ...)
//! - `--involved-objects`: kind of the object the event is about
//! - `--reasons`: machine-readable event reason
//!
//! An empty allow-list selects every value. Logs go to stderr.

mod cache;
mod config;
mod controller;
mod error;
mod filter;
mod reconciler;
mod record;
mod sink;
mod watcher;

#[cfg(test)]
mod test_utils;

use anyhow::Context;
use clap::Parser;
use config::Config;
use controller::Controller;
use error::ControllerError;
use k8s_openapi::api::core::v1::Event;
use kube::Api;
use sink::StdoutSink;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use watcher::Watcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    let config = Config::parse();
    run(config).await.context("event exporter failed")
}

/// Builds the watcher and controller from `config` and runs them until a
/// stop signal arrives.
async fn run(config: Config) -> Result<(), ControllerError> {
    let filter = config.filter_config()?;

    info!("Starting Event Exporter");
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Threadiness: {}", config.threadiness);
    info!("  Max retries: {}", config.max_retries);

    let client = config.kube_client().await?;
    let api: Api<Event> = match &config.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let (watcher, cache) = Watcher::new(api, keys_tx);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let controller = Controller::new(Arc::new(cache), keys_rx, filter, StdoutSink)
        .with_threadiness(usize::from(config.threadiness))
        .with_max_retries(config.max_retries)
        .with_cache_sync_timeout(config.cache_sync_timeout());

    let mut states = controller.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            debug!(?state, "controller state changed");
        }
    });

    controller.run(watcher.watch_events(), shutdown).await
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C");
            }
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C");
    }

    shutdown.cancel();
}

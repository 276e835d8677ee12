//! # Stream Hub Server
//!
//! Serves the filtered tweet stream to subscribers over WebSockets and long
//! polling.
//!
//! Startup: load configuration (defaults < `server_stream.conf` < env/CLI),
//! install logging, build the stream engine, optionally open the stream for
//! the configured tracks, then serve the hub over TLS when certificates are
//! available, plain HTTP otherwise. On SIGINT/SIGTERM the upstream stream is
//! closed, subscribers are disconnected and the server drains.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tokio::signal;

use lib_stream::loggers::{self, LoggerOptions};

mod stream_logic;
use stream_logic::{app, config};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Rustls 0.23+ requires an explicit crypto provider.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = config::load_config();
    let _log_guard = loggers::init(&LoggerOptions {
        app_name: "server_stream".to_string(),
        log_dir: config.log_dir.clone(),
        level: config.log_level.clone().unwrap_or_else(|| "info".to_string()),
    })?;

    let app = app::build(&config)?;
    app::autostart(&app, &config).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(5000)));
    let handle = axum_server::Handle::new();

    let signal_handle = handle.clone();
    let stream = app.stream.clone();
    let dispatcher = app.dispatcher.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown signal received. Closing server gracefully...");
        stream.stop().await;
        dispatcher.disconnect_all();
        signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    let service = app.router.clone().into_make_service();
    match config.tls_paths() {
        Some((cert, key)) => {
            tracing::info!(cert = %cert.display(), "Loading TLS certificates");
            let tls_config = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| anyhow::anyhow!("TLS Configuration Error: {}", e))?;
            tracing::info!("Stream hub live at https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(service)
                .await?;
        }
        None => {
            tracing::info!("Stream hub live at http://{}", addr);
            axum_server::bind(addr).handle(handle).serve(service).await?;
        }
    }

    app.stream.stop().await;
    tracing::info!("Shutdown complete.");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

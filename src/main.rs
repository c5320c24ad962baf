// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

use acmedns::backend;
use acmedns::config::Config;
use acmedns::dns::Server;
use anyhow::Result;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("acmedns")
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let config_file = config_file_from_args()?;
    let config = Config::load(config_file.as_deref())?;
    initialize_logging(&config.log.level);
    info!("starting acmedns");

    let cancel = CancellationToken::new();
    let backend = backend::build(&config).await.map_err(|err| {
        error!(code = err.code(), error = %err, "cannot build backend");
        err
    })?;

    let server = Server::new(&config, backend.clone())?;
    let running = server.start(&cancel).await.map_err(|err| {
        error!(code = err.code(), error = %err, "cannot start DNS server");
        err
    })?;

    wait_for_shutdown_signal().await?;
    info!("shutting down");

    let stop_result = running.stop().await;
    cancel.cancel();
    if let Err(err) = backend.close(&cancel).await {
        error!(code = err.code(), error = %err, "error closing backend");
    }
    stop_result?;
    info!("goodbye");
    Ok(())
}

/// The only positional argument is an optional config file path.
fn config_file_from_args() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let path = args.next().map(PathBuf::from);
    if args.next().is_some() {
        anyhow::bail!("usage: acmedns [/path/to/config.json]");
    }
    Ok(path)
}

/// Initialize logging. `RUST_LOG` wins over the configured level, and
/// `RUST_LOG_FORMAT=json` switches to JSON output.
fn initialize_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("acmedns={level}")));
    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .compact()
                .init();
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                result.map_err(anyhow::Error::from)
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                Ok(())
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received interrupt");
        Ok(())
    }
}

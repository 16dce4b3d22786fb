#![deny(unsafe_code)]
use amebo_catalog::Catalog;
use amebo_core::config::Engine;
use amebo_core::AmeboConfig;
use amebo_daemon::{build_app, AppState};
use amebo_dispatcher::Dispatcher;
use amebo_publisher::Publisher;
use amebo_replay::Replayer;
use amebo_schema::SchemaCache;
use amebo_store::Store;
use amebo_vault::Vault;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "amebo-daemon", version, about = "Amebo event-notification broker daemon")]
struct Args {
    /// Bind address, overriding `AMEBO_BIND` if given.
    #[arg(long)]
    bind: Option<String>,

    /// Enable verbose request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("amebo=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("amebo=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = AmeboConfig::from_env().context("load configuration")?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if config.secret_is_fallback {
        warn!("AMEBO_SECRET not set; signing tokens with a host-derived development fallback key");
    }

    let store = match config.engine {
        Engine::Embedded => {
            let path = config.dsn.clone().unwrap_or_else(|| "amebo.db".to_string());
            Store::connect_sqlite(&path)
                .await
                .with_context(|| format!("connect embedded store at {path}"))?
        }
        Engine::Networked => {
            let dsn = config
                .dsn
                .clone()
                .expect("AmeboConfig::from_env requires AMEBO_DSN for the networked engine");
            Store::connect_postgres(&dsn)
                .await
                .context("connect networked store")?
        }
    };

    let vault = Vault::new(store.clone(), config.secret.clone());
    if let (Some(username), Some(password)) = (&config.admin_username, &config.admin_password) {
        vault
            .bootstrap_admin(username, password)
            .await
            .context("bootstrap administrator credential")?;
    }

    let schema_cache = SchemaCache::new();
    let catalog = Catalog::new(store.clone(), vault.clone(), config.max_page_size);
    let publisher = Publisher::new(store.clone(), schema_cache);
    let replayer = Replayer::new(store.clone(), config.request_timeout);
    let dispatcher = Dispatcher::new(
        store.clone(),
        config.envelope_size,
        config.rest_when,
        config.idle,
        config.request_timeout,
    );

    let state = Arc::new(AppState {
        store,
        vault,
        catalog,
        publisher,
        replayer,
    });

    let cancel = CancellationToken::new();
    let dispatcher_cancel = cancel.clone();
    let dispatcher_handle = tokio::spawn(async move { dispatcher.run(dispatcher_cancel).await });

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, "amebo-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("serve")?;

    cancel.cancel();
    dispatcher_handle.await.context("dispatcher task panicked")?;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    cancel.cancel();
}

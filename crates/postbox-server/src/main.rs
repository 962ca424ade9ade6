//! Postbox - LMTP delivery server entry point

use anyhow::Result;
use postbox_common::{Config, LiveConfig};
use postbox_core::lmtp::tls;
use postbox_core::{BlockingLmtpServer, DeliveryCoordinator, LmtpServer, Metrics, WebhookCallback};
use postbox_storage::{
    create_blob_store, create_mailbox_store, AccountDirectory, BlobStore, DbAccountDirectory,
    MemoryDirectory,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config);
    info!("Starting Postbox LMTP server...");

    // Account directory
    let directory: Arc<dyn AccountDirectory> = match &config.database {
        Some(database) => {
            let directory = DbAccountDirectory::connect(database, &config.lmtp).await?;
            info!("Account database ready");
            Arc::new(directory)
        }
        None => {
            warn!("No database configured, using an empty in-memory account directory");
            Arc::new(MemoryDirectory::new())
        }
    };

    // Blob staging and mailboxes
    let blobs: Arc<dyn BlobStore> = Arc::from(create_blob_store(&config.storage)?);
    let mailboxes = create_mailbox_store(&config.storage)?;

    let metrics = Metrics::new()?;
    let live = LiveConfig::new(config.clone());
    let coordinator = Arc::new(DeliveryCoordinator::new(
        live.clone(),
        blobs,
        directory,
        mailboxes,
        metrics,
    ));

    for webhook in &config.callbacks.webhooks {
        match WebhookCallback::new(webhook) {
            Ok(callback) => coordinator.callbacks().register(Arc::new(callback)),
            Err(e) => warn!(url = %webhook.url, error = %e, "Skipping webhook"),
        }
    }

    let tls_config = tls::from_config(&config);

    // Event-driven LMTP listener
    let lmtp_handle = {
        let server = Arc::new(LmtpServer::new(coordinator.clone(), tls_config.clone()));
        info!("Starting LMTP server on {}:{}", config.lmtp.host, config.lmtp.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("LMTP server error: {}", e);
            }
        })
    };

    // Blocking LMTP listener if configured
    if let Some(port) = config.lmtp.blocking_port {
        let server = Arc::new(BlockingLmtpServer::new(
            coordinator.clone(),
            tls_config,
            tokio::runtime::Handle::current(),
        ));
        info!("Starting blocking LMTP server on {}:{}", config.lmtp.host, port);
        std::thread::Builder::new()
            .name("lmtp-blocking".to_string())
            .spawn(move || {
                if let Err(e) = server.run() {
                    error!("Blocking LMTP server error: {}", e);
                }
            })?;
    }

    // HTTP ingress if enabled
    let api_handle = if config.api.enabled {
        let app = postbox_api::create_router(coordinator.clone());
        let listener = tokio::net::TcpListener::bind(&config.api.bind).await?;
        info!("Starting HTTP ingress on {}", config.api.bind);
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP ingress error: {}", e);
            }
        }))
    } else {
        info!("HTTP ingress disabled");
        None
    };

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(live));

    info!("Postbox server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    lmtp_handle.abort();
    if let Some(handle) = api_handle {
        handle.abort();
    }

    info!("Postbox server shutdown complete");
    Ok(())
}

/// Re-read the configuration on SIGHUP. Listener addresses keep their
/// startup values; everything read at use time picks up the new file.
#[cfg(unix)]
async fn reload_on_hangup(live: LiveConfig<Config>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Configuration reload unavailable");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match Config::load() {
            Ok(config) => {
                live.set(config);
                info!("Configuration reloaded");
            }
            Err(e) => error!(error = %e, "Configuration reload failed"),
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},postbox=debug", config.logging.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

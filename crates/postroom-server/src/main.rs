//! Postroom - SMTP to chat room gateway entry point

use anyhow::Result;
use postroom_common::config::{Config, LoggingConfig};
use postroom_core::chat::ChatHandler;
use postroom_core::guard::DnsblLookup;
use postroom_core::{
    Bridge, BridgeParts, DkimSigner, Dispatcher, Dnsbl, MatrixClient, ResolverLookup,
    SenderValidator, SmtpMailer, SmtpServer,
};
use postroom_storage::create_store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    info!("Starting Postroom gateway...");

    let store = create_store(&config.database).await?;
    info!("Store ready ({})", config.database.backend);

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!("Failed to read system resolver config: {}. Using defaults.", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let matrix = Arc::new(MatrixClient::connect(&config.matrix).await?);
    info!("Connected to {}", config.matrix.homeserver);

    let transport = Arc::new(SmtpMailer::new(
        &config.server.hostname,
        config.mail.relay.clone(),
        resolver.clone(),
    ));

    let dnsbl = if config.dnsbl.enabled {
        let lookup: Arc<dyn DnsblLookup> = Arc::new(ResolverLookup::new(resolver.clone()));
        Some(Dnsbl::new(
            lookup,
            Dnsbl::providers_from_hosts(&config.dnsbl.providers),
            Duration::from_millis(config.dnsbl.timeout_ms),
        ))
    } else {
        info!("DNSBL checks disabled");
        None
    };

    let dkim = match &config.dkim {
        Some(dkim) => match DkimSigner::from_file(&dkim.selector, &dkim.private_key_path) {
            Ok(signer) => {
                info!("DKIM signing enabled with selector {}", dkim.selector);
                Some(signer)
            }
            Err(e) => {
                warn!("Failed to load DKIM key: {}. Outgoing mail will be unsigned.", e);
                None
            }
        },
        None => None,
    };

    let bridge = Arc::new(Bridge::new(
        &config,
        BridgeParts {
            store,
            chat: matrix.clone(),
            transport,
            dnsbl,
            validator: Some(SenderValidator::new(resolver, &config.server.hostname)),
            dkim,
        },
    ));
    bridge.start().await?;
    info!("Bridge started");

    // Room events
    let handler: Arc<dyn ChatHandler> = bridge.clone();
    let dispatcher = Dispatcher::start(handler);
    let sync_handle = {
        let matrix = matrix.clone();
        tokio::spawn(async move { matrix.sync_loop(dispatcher).await })
    };

    // SMTP listeners
    let smtp_server = Arc::new(SmtpServer::new(&config, bridge.clone()));
    info!(
        "Starting SMTP server on {}:{} (SMTP) and {}:{} (Submission)",
        config.smtp.host, config.smtp.port, config.smtp.host, config.smtp.submission_port
    );
    let smtp_handle = tokio::spawn(async move {
        if let Err(e) = smtp_server.run_dual_port().await {
            error!("SMTP server error: {}", e);
        }
    });

    // Delivery queue retries
    let queue_handle = {
        let bridge = bridge.clone();
        let interval = Duration::from_secs(config.queue.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match bridge.process_queue().await {
                    Ok(report) => {
                        if report.sent + report.failed + report.dropped > 0 {
                            info!(?report, "Delivery queue processed");
                        }
                    }
                    Err(e) => error!("Delivery queue error: {}", e),
                }
            }
        })
    };

    info!("Postroom started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    smtp_handle.abort();
    queue_handle.abort();
    sync_handle.abort();

    info!("Postroom shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

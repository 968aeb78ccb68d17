//! SMTP server implementation

use crate::bridge::Bridge;
use crate::smtp::session::{SessionConfig, SmtpSession};
use crate::smtp::tls::create_tls_acceptor;
use anyhow::Result;
use postroom_common::config::{Config, SmtpConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// SMTP service type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpServiceType {
    /// Inbound mail for the rooms
    Smtp,
    /// Authenticated sending from a room's mailbox
    Submission,
}

impl std::fmt::Display for SmtpServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtpServiceType::Smtp => write!(f, "SMTP"),
            SmtpServiceType::Submission => write!(f, "Submission"),
        }
    }
}

/// SMTP Server
pub struct SmtpServer {
    bridge: Arc<Bridge>,
    config: SmtpConfig,
    hostname: String,
    connection_semaphore: Arc<Semaphore>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl SmtpServer {
    pub fn new(full_config: &Config, bridge: Arc<Bridge>) -> Self {
        let tls_acceptor = match &full_config.tls {
            Some(tls_config) => match create_tls_acceptor(tls_config) {
                Ok(acceptor) => {
                    info!("TLS configured successfully");
                    Some(acceptor)
                }
                Err(e) => {
                    warn!("Failed to initialize TLS: {}. STARTTLS will be disabled.", e);
                    None
                }
            },
            None => None,
        };

        Self {
            bridge,
            config: full_config.smtp.clone(),
            hostname: full_config.server.hostname.clone(),
            connection_semaphore: Arc::new(Semaphore::new(full_config.smtp.max_connections)),
            tls_acceptor,
        }
    }

    /// Run the inbound listener and, unless its port is 0, the submission listener
    pub async fn run_dual_port(self: Arc<Self>) -> Result<()> {
        let smtp_server = self.clone();
        let smtp_handle =
            tokio::spawn(async move { smtp_server.run_service(SmtpServiceType::Smtp).await });

        if self.config.submission_port == 0 {
            info!("Submission service disabled");
            return match smtp_handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("SMTP task panicked: {}", e)),
            };
        }

        let submission_server = self.clone();
        let submission_handle = tokio::spawn(async move {
            submission_server
                .run_service(SmtpServiceType::Submission)
                .await
        });

        // Neither listener returns unless binding fails
        tokio::select! {
            result = smtp_handle => {
                match result {
                    Ok(Ok(())) => info!("SMTP service stopped"),
                    Ok(Err(e)) => error!("SMTP service error: {}", e),
                    Err(e) => error!("SMTP task panicked: {}", e),
                }
            }
            result = submission_handle => {
                match result {
                    Ok(Ok(())) => info!("Submission service stopped"),
                    Ok(Err(e)) => error!("Submission service error: {}", e),
                    Err(e) => error!("Submission task panicked: {}", e),
                }
            }
        }

        Ok(())
    }

    fn session_config(&self, service: SmtpServiceType) -> SessionConfig {
        SessionConfig {
            hostname: self.hostname.clone(),
            service,
            max_message_size: self.config.max_message_size,
            max_recipients: self.config.max_recipients,
            timeout: Duration::from_secs(self.config.connection_timeout_secs),
            tls: self.tls_acceptor.clone(),
        }
    }

    /// Accept connections for one service
    pub async fn run_service(&self, service_type: SmtpServiceType) -> Result<()> {
        let port = match service_type {
            SmtpServiceType::Smtp => self.config.port,
            SmtpServiceType::Submission => self.config.submission_port,
        };

        let addr = format!("{}:{}", self.config.host, port);
        let listener = TcpListener::bind(&addr).await?;

        let tls_status = if self.tls_acceptor.is_some() {
            "STARTTLS enabled"
        } else {
            "STARTTLS disabled"
        };
        info!("{} server listening on {} ({})", service_type, addr, tls_status);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("{}: Max connections reached, rejecting {}", service_type, peer_addr);
                            continue;
                        }
                    };

                    let session = SmtpSession::new(
                        self.bridge.clone(),
                        self.session_config(service_type),
                        peer_addr.to_string(),
                    );

                    tokio::spawn(async move {
                        if let Err(e) = session.handle(stream).await {
                            error!("{} session error from {}: {}", service_type, peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("{}: Failed to accept connection: {}", service_type, e);
                }
            }
        }
    }
}

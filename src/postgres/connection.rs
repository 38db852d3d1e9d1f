// ABOUTME: PostgreSQL connection handling with optional TLS
// ABOUTME: Sessions own their background connection task and are closed explicitly

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, NoTls};
use url::Url;

use crate::utils::{retry_with_backoff, strip_password_from_url};

/// TLS requirement derived from the URL's `sslmode` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Disable,
    /// Encrypt, do not verify the certificate (libpq `require`).
    Require,
    /// Verify the certificate chain but not the hostname.
    VerifyCa,
    VerifyFull,
}

impl TlsMode {
    fn from_sslmode(value: &str) -> Result<Self> {
        match value {
            "disable" | "allow" | "prefer" => Ok(TlsMode::Disable),
            "require" => Ok(TlsMode::Require),
            "verify-ca" => Ok(TlsMode::VerifyCa),
            "verify-full" => Ok(TlsMode::VerifyFull),
            other => anyhow::bail!("Unsupported sslmode '{}'", other),
        }
    }
}

/// Split a connection URL into a tokio-postgres config and the TLS mode.
///
/// `sslmode` is stripped before parsing because tokio-postgres does not
/// understand the `verify-*` modes.
pub fn parse_connection_url(url: &str) -> Result<(Config, TlsMode)> {
    let mut parsed = Url::parse(url).context("Invalid connection URL")?;

    let mut tls = TlsMode::Disable;
    let mut kept: Vec<(String, String)> = Vec::new();
    for (key, value) in parsed.query_pairs() {
        if key == "sslmode" {
            tls = TlsMode::from_sslmode(&value)?;
        } else {
            kept.push((key.into_owned(), value.into_owned()));
        }
    }

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut config = Config::from_str(parsed.as_str()).with_context(|| {
        format!(
            "Failed to parse connection string {}",
            strip_password_from_url(url).unwrap_or_default()
        )
    })?;
    if tls != TlsMode::Disable {
        config.ssl_mode(SslMode::Require);
    }
    if config.get_connect_timeout().is_none() {
        config.connect_timeout(Duration::from_secs(30));
    }

    Ok((config, tls))
}

/// An open client plus the task driving its connection.
pub struct PgSession {
    client: Client,
    connection: JoinHandle<()>,
}

impl PgSession {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Drop the client and wait for the connection task to finish.
    pub async fn close(self) {
        drop(self.client);
        if let Err(e) = self.connection.await {
            tracing::warn!("Connection task ended abnormally: {}", e);
        }
    }
}

/// Open a session to `url`.
pub async fn connect(url: &str) -> Result<PgSession> {
    let (config, tls) = parse_connection_url(url)?;
    let display_url = strip_password_from_url(url).unwrap_or_default();

    let (client, connection) = match tls {
        TlsMode::Disable => {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .with_context(|| format!("Failed to connect to {}", display_url))?;
            let label = display_url.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("Connection error on {}: {}", label, e);
                }
            });
            (client, handle)
        }
        mode => {
            let mut builder = TlsConnector::builder();
            match mode {
                TlsMode::Require => {
                    builder
                        .danger_accept_invalid_certs(true)
                        .danger_accept_invalid_hostnames(true);
                }
                TlsMode::VerifyCa => {
                    builder.danger_accept_invalid_hostnames(true);
                }
                _ => {}
            }
            let connector = builder.build().context("Failed to build TLS connector")?;
            let (client, connection) = config
                .connect(MakeTlsConnector::new(connector))
                .await
                .with_context(|| format!("Failed to connect to {}", display_url))?;
            let label = display_url.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("Connection error on {}: {}", label, e);
                }
            });
            (client, handle)
        }
    };

    tracing::debug!("Connected to {}", display_url);
    Ok(PgSession { client, connection })
}

/// Open a session, retrying transient failures with exponential backoff.
pub async fn connect_with_retry(url: &str) -> Result<PgSession> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

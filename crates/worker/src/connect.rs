//! Broker connection.

use fishsense_db::DbPool;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::config::WorkerConfig;

/// Connections beyond `max_workers` for the pollers and the sweeper.
const POLLER_CONNECTIONS: u32 = 3;

/// Connect options for the broker database. With TLS on, the server
/// certificate is verified against `domain` when set, otherwise `host`.
pub fn connect_options(config: &WorkerConfig) -> PgConnectOptions {
    let host = match (&config.domain, config.tls) {
        (Some(domain), true) => domain.as_str(),
        _ => config.host.as_str(),
    };

    let mut options = PgConnectOptions::new()
        .host(host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user);
    if let Some(password) = &config.password {
        options = options.password(password);
    }

    if !config.tls {
        return options.ssl_mode(PgSslMode::Disable);
    }
    options = options.ssl_mode(PgSslMode::VerifyFull);
    if let Some(cert) = &config.client_cert {
        options = options.ssl_client_cert(cert);
    }
    if let Some(key) = &config.client_private_key {
        options = options.ssl_client_key(key);
    }
    if let Some(ca) = &config.server_root_ca_cert {
        options = options.ssl_root_cert(ca);
    }
    options
}

/// Open the broker connection pool.
pub async fn connect(config: &WorkerConfig) -> Result<DbPool, sqlx::Error> {
    let max_connections = u32::try_from(config.max_workers)
        .unwrap_or(u32::MAX)
        .saturating_add(POLLER_CONNECTIONS);
    tracing::info!(
        host = %config.host,
        port = config.port,
        tls = config.tls,
        max_connections,
        "Connecting to broker"
    );
    let pool = fishsense_db::connect_with(connect_options(config), max_connections).await?;
    fishsense_db::health_check(&pool).await?;
    Ok(pool)
}

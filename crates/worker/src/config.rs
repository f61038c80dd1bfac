//! Worker configuration loaded from the environment.

use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid worker configuration: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Broker connection and pool settings.
#[derive(Clone, Validate)]
#[validate(schema(function = "validate_tls_material"))]
pub struct WorkerConfig {
    /// Broker host name or IP address.
    #[validate(custom(function = "validate_host"))]
    pub host: String,
    pub port: u16,
    /// Connect over TLS with a client certificate.
    pub tls: bool,
    #[validate(custom(function = "validate_file_exists"))]
    pub client_cert: Option<String>,
    #[validate(custom(function = "validate_file_exists"))]
    pub client_private_key: Option<String>,
    /// Server name to verify when TLS is on.
    pub domain: Option<String>,
    #[validate(custom(function = "validate_file_exists"))]
    pub server_root_ca_cert: Option<String>,
    #[validate(length(min = 1))]
    pub database: String,
    #[validate(length(min = 1))]
    pub user: String,
    pub password: Option<String>,
    /// Concurrent workflow and activity tasks.
    #[validate(range(min = 1))]
    pub max_workers: usize,
    /// Directory for the rolling log files.
    pub log_dir: PathBuf,
}

/// Log directory inside the worker container image.
const DOCKER_LOG_DIR: &str = "/e4efs/logs";

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                      | Default     |
    /// |------------------------------|-------------|
    /// | `BROKER_HOST`                | required    |
    /// | `BROKER_PORT`                | `7233`      |
    /// | `BROKER_TLS`                 | `false`     |
    /// | `BROKER_CLIENT_CERT`         | required with TLS |
    /// | `BROKER_CLIENT_PRIVATE_KEY`  | required with TLS |
    /// | `BROKER_DOMAIN`              | unset       |
    /// | `BROKER_SERVER_ROOT_CA_CERT` | unset       |
    /// | `BROKER_DATABASE`            | `fishsense` |
    /// | `BROKER_USER`                | `fishsense` |
    /// | `BROKER_PASSWORD`            | unset       |
    /// | `MAX_WORKERS`                | `4`         |
    /// | `LOG_DIR`                    | `logs`, or `/e4efs/logs` when `E4EFS_DOCKER` is set |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|name| std::env::var(name).ok())
    }

    /// Build and validate a configuration from any variable lookup. Empty
    /// values count as unset.
    pub fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let config = Self {
            host: var("BROKER_HOST").ok_or(ConfigError::Missing("BROKER_HOST"))?,
            port: parse_or("BROKER_PORT", var("BROKER_PORT"), 7233)?,
            tls: parse_bool("BROKER_TLS", var("BROKER_TLS"))?,
            client_cert: var("BROKER_CLIENT_CERT"),
            client_private_key: var("BROKER_CLIENT_PRIVATE_KEY"),
            domain: var("BROKER_DOMAIN"),
            server_root_ca_cert: var("BROKER_SERVER_ROOT_CA_CERT"),
            database: var("BROKER_DATABASE").unwrap_or_else(|| "fishsense".into()),
            user: var("BROKER_USER").unwrap_or_else(|| "fishsense".into()),
            // Not trimmed; whitespace may be part of a password.
            password: get("BROKER_PASSWORD").filter(|v| !v.is_empty()),
            max_workers: parse_or("MAX_WORKERS", var("MAX_WORKERS"), 4)?,
            log_dir: match (var("LOG_DIR"), var("E4EFS_DOCKER")) {
                (Some(dir), _) => PathBuf::from(dir),
                (None, Some(_)) => PathBuf::from(DOCKER_LOG_DIR),
                (None, None) => PathBuf::from("logs"),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("client_cert", &self.client_cert)
            .field("client_private_key", &self.client_private_key)
            .field("domain", &self.domain)
            .field("server_root_ca_cert", &self.server_root_ca_cert)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("max_workers", &self.max_workers)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool(var: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = raw else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            reason: "expected true or false".into(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Validation rules
// ---------------------------------------------------------------------------

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Owned(message));
    err
}

fn validate_host(host: &String) -> Result<(), ValidationError> {
    if IpAddr::from_str(host).is_ok() || is_hostname(host) {
        Ok(())
    } else {
        Err(invalid("host", format!("{host} is not a hostname or IP address")))
    }
}

/// RFC 1123 host name: dot-separated labels of letters, digits and inner
/// hyphens, each at most 63 bytes, at most 253 bytes overall.
fn is_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

fn validate_file_exists(path: &String) -> Result<(), ValidationError> {
    if Path::new(path).is_file() {
        Ok(())
    } else {
        Err(invalid("file_exists", format!("{path} does not exist")))
    }
}

fn validate_tls_material(config: &WorkerConfig) -> Result<(), ValidationError> {
    if config.tls && (config.client_cert.is_none() || config.client_private_key.is_none()) {
        return Err(invalid(
            "tls_material",
            "BROKER_TLS requires BROKER_CLIENT_CERT and BROKER_CLIENT_PRIVATE_KEY".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_source(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_host_is_set() {
        let config = load(&[("BROKER_HOST", "orchestration.fishsense.e4e.ucsd.edu")]).unwrap();
        assert_eq!(config.port, 7233);
        assert!(!config.tls);
        assert_eq!(config.database, "fishsense");
        assert_eq!(config.user, "fishsense");
        assert_eq!(config.password, None);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn log_dir_follows_the_container_flag_unless_set() {
        let config = load(&[("BROKER_HOST", "localhost"), ("E4EFS_DOCKER", "1")]).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/e4efs/logs"));

        let config = load(&[
            ("BROKER_HOST", "localhost"),
            ("E4EFS_DOCKER", "1"),
            ("LOG_DIR", "/var/log/fishsense"),
        ])
        .unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/var/log/fishsense"));
    }

    #[test]
    fn host_is_required() {
        assert_matches!(load(&[]), Err(ConfigError::Missing("BROKER_HOST")));
        assert_matches!(
            load(&[("BROKER_HOST", "  ")]),
            Err(ConfigError::Missing("BROKER_HOST"))
        );
    }

    #[test]
    fn ip_addresses_and_hostnames_are_accepted() {
        for host in ["10.0.0.5", "::1", "localhost", "db-1.internal."] {
            assert!(load(&[("BROKER_HOST", host)]).is_ok(), "{host}");
        }
    }

    #[test]
    fn malformed_hosts_are_rejected() {
        for host in ["-db", "db_1", "a..b", "db:5432"] {
            let err = load(&[("BROKER_HOST", host)]).unwrap_err();
            assert_matches!(err, ConfigError::Validation(ref e) if e.field_errors().contains_key("host"));
        }
    }

    #[test]
    fn numbers_must_parse() {
        assert_matches!(
            load(&[("BROKER_HOST", "localhost"), ("BROKER_PORT", "70000")]),
            Err(ConfigError::Invalid { var: "BROKER_PORT", .. })
        );
        assert_matches!(
            load(&[("BROKER_HOST", "localhost"), ("MAX_WORKERS", "many")]),
            Err(ConfigError::Invalid { var: "MAX_WORKERS", .. })
        );
        assert_matches!(
            load(&[("BROKER_HOST", "localhost"), ("BROKER_TLS", "maybe")]),
            Err(ConfigError::Invalid { var: "BROKER_TLS", .. })
        );
    }

    #[test]
    fn max_workers_must_be_positive() {
        let err = load(&[("BROKER_HOST", "localhost"), ("MAX_WORKERS", "0")]).unwrap_err();
        assert_matches!(err, ConfigError::Validation(ref e) if e.field_errors().contains_key("max_workers"));
    }

    #[test]
    fn tls_requires_existing_client_material() {
        assert_matches!(
            load(&[("BROKER_HOST", "localhost"), ("BROKER_TLS", "true")]),
            Err(ConfigError::Validation(_))
        );

        let err = load(&[
            ("BROKER_HOST", "localhost"),
            ("BROKER_TLS", "true"),
            ("BROKER_CLIENT_CERT", "/nonexistent/client.pem"),
            ("BROKER_CLIENT_PRIVATE_KEY", "/nonexistent/client.key"),
        ])
        .unwrap_err();
        assert_matches!(err, ConfigError::Validation(ref e) if e.field_errors().contains_key("client_cert"));

        let cert = NamedTempFile::new().unwrap();
        let key = NamedTempFile::new().unwrap();
        let ca = NamedTempFile::new().unwrap();
        let config = load(&[
            ("BROKER_HOST", "10.0.0.5"),
            ("BROKER_TLS", "TRUE"),
            ("BROKER_CLIENT_CERT", cert.path().to_str().unwrap()),
            ("BROKER_CLIENT_PRIVATE_KEY", key.path().to_str().unwrap()),
            ("BROKER_SERVER_ROOT_CA_CERT", ca.path().to_str().unwrap()),
            ("BROKER_DOMAIN", "orchestration.fishsense.e4e.ucsd.edu"),
        ])
        .unwrap();
        assert!(config.tls);
        assert_eq!(config.domain.as_deref(), Some("orchestration.fishsense.e4e.ucsd.edu"));
    }

    #[test]
    fn password_is_kept_verbatim_and_redacted() {
        let config = load(&[("BROKER_HOST", "localhost"), ("BROKER_PASSWORD", " s3cret ")]).unwrap();
        assert_eq!(config.password.as_deref(), Some(" s3cret "));
        let debug = format!("{config:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("***"));
    }
}

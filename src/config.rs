//! Worker configuration.
//!
//! Everything is taken from the environment.  A `.env` file is honoured if
//! present, but never overrides variables already set by the environment,
//! so container deployments stay authoritative.

use std::fmt;

//------------ Config --------------------------------------------------------

/// The complete worker configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Connection URL for the relational store.
    pub database_url: String,

    /// Connection URI for the message broker.
    pub amqp_url: String,

    /// SIFEN batch reception endpoint.
    pub url_recebe_lote: String,

    /// SIFEN batch status endpoint.
    pub url_consulta_lote: String,

    /// SIFEN event reception endpoint.
    pub url_evento: String,

    /// Base URL prefixed to the QR token query string.
    pub url_qr: String,

    /// How long a deferred poll sits in the delay queue, in milliseconds.
    pub delay_ttl_ms: u32,

    /// Upper bound on the poll attempt counter.
    pub max_poll_attempts: u32,

    /// How many unacknowledged messages the broker may dispatch at once.
    pub prefetch_count: u16,

    /// Default log level directive.
    pub log_level: String,
}

impl Config {
    /// Build the configuration from the environment.
    ///
    /// All missing required variables are reported at once rather than one
    /// per start attempt.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Ignore a missing .env file; the environment itself may be
        // complete.
        let _ = dotenvy::dotenv();

        let mut missing = Vec::new();
        let mut require = |name: &str| -> String {
            match std::env::var(name) {
                Ok(v) if !v.trim().is_empty() => v,
                _ => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        };

        let database_url = require("DATABASE_URL");
        let url_recebe_lote = require("URL_SIFEN_RECEBE_LOTE");
        let url_consulta_lote = require("URL_SIFEN_CONSULTA_LOTE");
        let url_evento = require("URL_SIFEN_EVENTO");
        let url_qr = require("URL_SIFEN_QR");

        let amqp_url = match std::env::var("RABBITMQ_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => {
                let host = require("RABBITMQ_HOST");
                let user = require("RABBITMQ_USER");
                let pass = require("RABBITMQ_PASS");
                let port = optional_parsed("RABBITMQ_PORT", 5672u16)?;
                let vhost =
                    std::env::var("RABBITMQ_VHOST").unwrap_or_else(|_| "/".to_string());
                format!(
                    "amqp://{user}:{pass}@{host}:{port}/{}",
                    percent_encode_vhost(&vhost)
                )
            }
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Ok(Self {
            database_url,
            amqp_url,
            url_recebe_lote,
            url_consulta_lote,
            url_evento,
            url_qr,
            delay_ttl_ms: optional_parsed("DELAY_TTL_MS", 30_000u32)?,
            max_poll_attempts: optional_parsed("MAX_TENTATIVAS_CONSULTA", 10u32)?,
            prefetch_count: optional_parsed("PREFETCH_COUNT", 1u16)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Read an optional variable, parsing it into its target type.
fn optional_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            v.trim().parse().map_err(|_| ConfigError::Invalid {
                var: name.to_string(),
                value: v,
            })
        }
        _ => Ok(default),
    }
}

/// Encode a broker vhost for use in an AMQP URI.
///
/// The default vhost is the single character `/`, which must appear as
/// `%2f` in the URI path.
fn percent_encode_vhost(vhost: &str) -> String {
    let mut out = String::with_capacity(vhost.len());
    for c in vhost.chars() {
        match c {
            '/' => out.push_str("%2f"),
            '%' => out.push_str("%25"),
            c => out.push(c),
        }
    }
    out
}

//------------ ConfigError ---------------------------------------------------

/// The configuration could not be assembled from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Required variables were absent or empty.
    Missing(Vec<String>),

    /// A variable was present but could not be parsed.
    Invalid { var: String, value: String },
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(vars) => {
                write!(f, "missing environment variables: {}", vars.join(", "))
            }
            Self::Invalid { var, value } => {
                write!(f, "environment variable {var} has unusable value '{value}'")
            }
        }
    }
}

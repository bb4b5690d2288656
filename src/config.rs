//! Configuration loaded from environment variables (and `.env` via dotenvy).

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be set together with ADMIN_UID")]
    Incomplete(&'static str),
}

/// Broker settings; the change feed and timers are off without them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Role record created at startup when missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapAdmin {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    /// Unset selects the in-memory store.
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub db_connect_timeout: Duration,
    /// Upper bound on a single store call, including lock waits.
    pub transaction_timeout: Duration,
    pub amqp: Option<AmqpConfig>,
    pub admin: Option<BootstrapAdmin>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let amqp = match text("AMQP_HOST") {
            Some(host) => Some(AmqpConfig {
                host,
                port: parse(&lookup, "AMQP_PORT", 5672)?,
                user: text("AMQP_USER").unwrap_or_else(|| "guest".to_string()),
                password: text("AMQP_PASSWORD").unwrap_or_else(|| "guest".to_string()),
            }),
            None => None,
        };

        let admin = match text("ADMIN_UID") {
            Some(uid) => Some(BootstrapAdmin {
                uid,
                email: text("ADMIN_EMAIL").ok_or(ConfigError::Incomplete("ADMIN_EMAIL"))?,
                display_name: text("ADMIN_NAME"),
            }),
            None => None,
        };

        Ok(Self {
            bind_addr: text("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse(&lookup, "PORT", 8080)?,
            database_url: text("DATABASE_URL"),
            db_pool_size: positive(&lookup, "DB_POOL_SIZE", 10)?,
            db_connect_timeout: Duration::from_millis(positive(
                &lookup,
                "DB_CONNECT_TIMEOUT_MS",
                5000,
            )?),
            transaction_timeout: Duration::from_millis(positive(
                &lookup,
                "TRANSACTION_TIMEOUT_MS",
                5000,
            )?),
            amqp,
            admin,
        })
    }
}

fn parse<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

/// Pool sizes and timeouts of zero would disable the bound they set.
fn positive<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq,
{
    let value = parse(lookup, name, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: lookup(name).unwrap_or_default(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.db_pool_size, 10);
        assert_eq!(cfg.transaction_timeout, Duration::from_millis(5000));
        assert!(cfg.amqp.is_none());
        assert!(cfg.admin.is_none());
    }

    #[test]
    fn broker_settings_follow_the_host() {
        let cfg = config(&[("AMQP_HOST", "rabbit"), ("AMQP_PORT", "5673")]).unwrap();
        assert_eq!(
            cfg.amqp,
            Some(AmqpConfig {
                host: "rabbit".into(),
                port: 5673,
                user: "guest".into(),
                password: "guest".into(),
            })
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        assert_eq!(
            config(&[("PORT", "eighty")]),
            Err(ConfigError::Invalid {
                name: "PORT",
                value: "eighty".into()
            })
        );
        assert!(config(&[("TRANSACTION_TIMEOUT_MS", "-1")]).is_err());
    }

    #[test]
    fn zero_pool_size_and_timeouts_are_rejected() {
        for name in ["DB_POOL_SIZE", "DB_CONNECT_TIMEOUT_MS", "TRANSACTION_TIMEOUT_MS"] {
            assert_eq!(
                config(&[(name, "0")]),
                Err(ConfigError::Invalid {
                    name,
                    value: "0".into()
                }),
                "{name}"
            );
        }
        let cfg = config(&[("DB_POOL_SIZE", "1"), ("TRANSACTION_TIMEOUT_MS", "1")]).unwrap();
        assert_eq!(cfg.db_pool_size, 1);
        assert_eq!(cfg.transaction_timeout, Duration::from_millis(1));
    }

    #[test]
    fn bootstrap_admin_needs_an_email() {
        assert_eq!(
            config(&[("ADMIN_UID", "root")]),
            Err(ConfigError::Incomplete("ADMIN_EMAIL"))
        );
        let cfg = config(&[("ADMIN_UID", "root"), ("ADMIN_EMAIL", "root@example.com")]).unwrap();
        assert_eq!(cfg.admin.map(|a| a.uid), Some("root".to_string()));
    }
}

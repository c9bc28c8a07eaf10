use std::num::ParseIntError;

use redis::{ConnectionInfo, IntoConnectionInfo, RedisError};
use thiserror::Error;

const REDIS_ADDR: &str = "REDIS_ADDR";
const REDIS_PORT: &str = "REDIS_PORT";
const REDIS_USER: &str = "REDIS_USER";
const REDIS_PASSWORD: &str = "REDIS_PASSWORD";
const REDIS_DATABASE: &str = "REDIS_DATABASE";
const NAMESPACE: &str = "LIGHTJQ_NAMESPACE";

const DEFAULT_REDIS_ADDR: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidNumber {
        key: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("Invalid redis address")]
    InvalidAddress(#[from] RedisError),
}

/// Where the master finds its broker, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub addr: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
    pub namespace: String,
}

impl RedisConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key| lookup(key).filter(|value| !value.is_empty());
        let number = |key: &'static str| {
            non_empty(key)
                .map(|value| {
                    value
                        .parse::<i64>()
                        .map_err(|source| ConfigError::InvalidNumber { key, value, source })
                })
                .transpose()
        };

        Ok(Self {
            addr: non_empty(REDIS_ADDR).unwrap_or_else(|| DEFAULT_REDIS_ADDR.to_owned()),
            port: number(REDIS_PORT)?
                .map(|port| u16::try_from(port).unwrap_or_default())
                .filter(|port| *port != 0)
                .unwrap_or(DEFAULT_REDIS_PORT),
            username: non_empty(REDIS_USER),
            password: non_empty(REDIS_PASSWORD),
            database: number(REDIS_DATABASE)?.unwrap_or_default(),
            namespace: non_empty(NAMESPACE)
                .unwrap_or_else(|| lightjq_redis::DEFAULT_NAMESPACE.to_owned()),
        })
    }

    pub fn connection_info(&self) -> Result<ConnectionInfo, ConfigError> {
        let mut info = (self.addr.as_str(), self.port).into_connection_info()?;
        info.redis.db = self.database;
        info.redis.username = self.username.clone();
        info.redis.password = self.password.clone();
        Ok(info)
    }
}

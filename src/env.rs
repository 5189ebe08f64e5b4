use std::env;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;

use crate::config::{ProviderConfig, QueueSettings};

pub const QUEUE_URL: &str = "QUEUE_URL";
pub const QUEUE_PREFIX: &str = "QUEUE_PREFIX";
pub const QUEUE_CONNECT_TIMEOUT_MS: &str = "QUEUE_CONNECT_TIMEOUT_MS";

/// Queue settings taken from the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub url: Option<String>,
    pub prefix: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

impl EnvOverrides {
    /// Read the process environment, loading `.env` first if present.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let connect_timeout_ms: Option<u64> = match lookup(QUEUE_CONNECT_TIMEOUT_MS) {
            Some(value) => Some(
                value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{} must be a number of milliseconds", QUEUE_CONNECT_TIMEOUT_MS))?,
            ),
            None => None,
        };

        Ok(Self {
            url: lookup(QUEUE_URL),
            prefix: lookup(QUEUE_PREFIX),
            connect_timeout_ms,
        })
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, config: &mut ProviderConfig) {
        if let Some(url) = &self.url {
            config.queue.url = url.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.queue.prefix = prefix.clone();
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.queue.connect_timeout_ms = Some(timeout);
        }
    }

    /// A config built from the environment alone.
    pub fn into_config(self) -> Result<ProviderConfig> {
        let url = self
            .url
            .ok_or_else(|| anyhow!("{} is not set", QUEUE_URL))?;

        Ok(ProviderConfig {
            queue: QueueSettings {
                url,
                prefix: self.prefix.unwrap_or_default(),
                connect_timeout_ms: self.connect_timeout_ms,
            },
        })
    }
}

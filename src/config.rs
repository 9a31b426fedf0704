use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::message::types;

const DEFAULT_MAX_PARCEL_SIZE: usize = 3500;
const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MESSAGE_EXPIRATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAX_PENDING_PER_TYPE: usize = 50;
const DEFAULT_SENDER_BACKOFF: Duration = Duration::from_secs(10);
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_COURIER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    /// Upper bound on the summed size of the messages placed in one parcel.
    pub max_parcel_size: Option<usize>,

    /// How long a message may stay in flight without an ack before it is sent again.
    pub message_timeout_ms: Option<u64>,

    /// How long a message is kept, counted from its creation, unless it overrides it.
    pub message_expiration_ms: Option<u64>,

    pub default_max_pending_per_type: Option<usize>,

    /// Per message type limits, given as `type=limit` pairs separated by commas.
    #[serde(default, deserialize_with = "deserialize_type_limits")]
    pub max_pending_per_type: HashMap<i32, usize>,

    pub sender_backoff_ms: Option<u64>,

    pub flush_interval_ms: Option<u64>,

    pub courier_timeout_ms: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("PARCELPOST_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("parcelpost.db")
    }

    pub fn max_parcel_size(&self) -> usize {
        self.max_parcel_size.unwrap_or(DEFAULT_MAX_PARCEL_SIZE)
    }

    pub fn message_timeout(&self) -> Duration {
        self.message_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MESSAGE_TIMEOUT)
    }

    pub fn message_expiration(&self) -> Duration {
        self.message_expiration_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MESSAGE_EXPIRATION)
    }

    /// Maximum number of pending messages allowed for the given message type.
    ///
    /// Explicit overrides win, then the built-in limits for well known types,
    /// then the configured default.
    pub fn max_pending_for_type(&self, message_type: i32) -> usize {
        if let Some(limit) = self.max_pending_per_type.get(&message_type) {
            return *limit;
        }

        match message_type {
            types::REGISTRATION => 20,
            _ => self
                .default_max_pending_per_type
                .unwrap_or(DEFAULT_MAX_PENDING_PER_TYPE),
        }
    }

    pub fn sender_backoff(&self) -> Duration {
        self.sender_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SENDER_BACKOFF)
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL)
    }

    pub fn courier_timeout(&self) -> Duration {
        self.courier_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_COURIER_TIMEOUT)
    }
}

fn parse_type_limits(input: &str) -> Result<HashMap<i32, usize>, String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (ty, limit) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected `type=limit`, got `{pair}`"))?;
            let ty = ty
                .trim()
                .parse::<i32>()
                .map_err(|e| format!("invalid message type `{ty}`: {e}"))?;
            let limit = limit
                .trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid limit `{limit}`: {e}"))?;
            Ok((ty, limit))
        })
        .collect()
}

fn deserialize_type_limits<'de, D>(deserializer: D) -> Result<HashMap<i32, usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_type_limits(&raw).map_err(serde::de::Error::custom)
}

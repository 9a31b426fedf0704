use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{Message, MessageState, SendPriority, StoredMessage};

/// On-disk form of a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    #[serde(rename = "type")]
    pub message_type: i32,
    #[serde(rename = "id")]
    pub message_id: String,
    pub priority: SendPriority,
    pub data: Map<String, Value>,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Expiration override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,
    pub state: MessageState,
    #[serde(default)]
    pub attempts: HashMap<String, u32>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
}

impl From<&StoredMessage> for PersistedMessage {
    fn from(stored: &StoredMessage) -> Self {
        Self {
            message_type: stored.message.message_type,
            message_id: stored.message.message_id.clone(),
            priority: stored.send_priority,
            data: stored.message.payload.clone(),
            size: stored.message_size,
            group: stored.parcel_group_key.clone(),
            expire: stored
                .expire_after
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            state: stored.state.clone(),
            attempts: stored.send_attempts.clone(),
            time: stored.message.time,
        }
    }
}

impl PersistedMessage {
    /// Rebuilds the stored message. Restored messages always wait for
    /// registration, since that is the only combination which gets persisted.
    pub fn into_stored(self) -> StoredMessage {
        StoredMessage {
            message: Message {
                message_type: self.message_type,
                message_id: self.message_id,
                time: self.time,
                payload: self.data,
            },
            send_priority: self.priority,
            requires_registration: true,
            persist: true,
            message_size: self.size,
            parcel_group_key: self.group,
            expire_after: self.expire.map(Duration::from_millis),
            state: self.state,
            send_attempts: self.attempts,
        }
    }
}

//! Message types and lifecycle states for the outbound message buffer.
//!
//! This module defines the messages producers hand to the post office, the
//! delivery metadata the store keeps next to them, and the states a message moves
//! through until it is delivered, expired or dropped.
//!
//! # Message Lifecycle
//!
//! 1. Messages are stored in the `Stored` state
//! 2. When handed to a courier, they move to `InFlight`
//! 3. If the courier acknowledges the parcel, they become `Sent` and leave the store
//! 4. If the courier fails or the in-flight time runs out, they go back to `Stored`
//!
//! `Created` only exists for records written by older versions and is never
//! collected for sending.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::Error, utils::generate_id};

pub(crate) const MESSAGE_ID_LENGTH: usize = 15;

/// Well known message types the buffer treats specially.
pub mod types {
    /// The one-time registration handshake message.
    pub const REGISTRATION: i32 = 10;
}

/// Controls how aggressively a stored message triggers a send attempt.
///
/// Variants are ordered from the least to the most urgent, so the maximum of a
/// set of priorities is the most urgent one.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SendPriority {
    /// Only sent along with other messages or by the periodic flush
    Whenever,
    /// Sent once a full parcel worth of messages is available
    Buffer,
    /// Sent within a few minutes
    Late,
    /// Sent within a couple of seconds
    Soon,
    /// Sent right away
    Immediate,
}

/// Current state of a stored message.
///
/// The state transitions follow:
/// `Stored` -> `InFlight` -> `Sent`   (success case)
/// `Stored` -> `InFlight` -> `Stored` (courier error or in-flight timeout)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum MessageState {
    #[serde(rename = "created")]
    Created,
    /// Waiting to be collected into a parcel
    #[serde(rename = "stored")]
    Stored {
        /// Assigned when a parcel containing this message was split
        #[serde(rename = "parcel_subgroup", default)]
        parcel_sub_group_key: Option<String>,
    },
    /// Handed to a courier, waiting for an ack or an error
    #[serde(rename = "in-flight")]
    InFlight {
        #[serde(rename = "time", with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        courier: String,
        #[serde(rename = "parcel")]
        parcel_id: String,
    },
    /// Acknowledged by a courier
    #[serde(rename = "sent")]
    Sent { parcel_id: String, courier: String },
}

impl MessageState {
    pub fn stored() -> Self {
        Self::Stored {
            parcel_sub_group_key: None,
        }
    }

    pub fn stored_in_sub_group(key: impl Into<String>) -> Self {
        Self::Stored {
            parcel_sub_group_key: Some(key.into()),
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight { .. })
    }

    /// The parcel this message is currently in flight with, if any.
    pub fn in_flight_parcel(&self) -> Option<&str> {
        match self {
            Self::InFlight { parcel_id, .. } => Some(parcel_id),
            _ => None,
        }
    }

    pub fn parcel_sub_group_key(&self) -> Option<&str> {
        match self {
            Self::Stored {
                parcel_sub_group_key,
            } => parcel_sub_group_key.as_deref(),
            _ => None,
        }
    }
}

/// An immutable unit of outbound data.
///
/// The payload is a JSON object; its canonical wire form is the payload with a
/// `time` field (milliseconds since the epoch) added.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: i32,
    pub message_id: String,
    pub time: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl Message {
    /// Creates a message with a freshly generated id, timestamped now.
    pub fn new(message_type: i32, payload: Map<String, Value>) -> Self {
        Self::with_id(message_type, generate_id(MESSAGE_ID_LENGTH), payload)
    }

    pub fn with_id(
        message_type: i32,
        message_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_type,
            message_id: message_id.into(),
            time: Utc::now(),
            payload,
        }
    }

    /// Builds a message from any value which serializes to a JSON object.
    pub fn from_serializable<T: Serialize>(message_type: i32, data: &T) -> Result<Self, Error> {
        match serde_json::to_value(data)? {
            Value::Object(payload) => Ok(Self::new(message_type, payload)),
            other => Err(Error::invalid_payload(format!(
                "message data must serialize to an object, got {other}"
            ))),
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn to_json_value(&self) -> Value {
        let mut data = self.payload.clone();
        data.insert("time".to_owned(), Value::from(self.time.timestamp_millis()));
        Value::Object(data)
    }

    pub fn to_json(&self) -> String {
        self.to_json_value().to_string()
    }

    /// Size of the canonical wire form in bytes.
    pub fn size(&self) -> usize {
        self.to_json().len()
    }
}

/// Options given by producers when handing a message to the post office.
#[derive(Debug, Clone, bon::Builder)]
pub struct SendOptions {
    #[builder(default = SendPriority::Soon)]
    pub priority: SendPriority,
    /// Keep the message across restarts until it is sent
    #[builder(default = true)]
    pub persist: bool,
    /// Hold the message until the registration handshake has completed
    #[builder(default = true)]
    pub requires_registration: bool,
    /// Messages are only parceled with messages carrying the same key
    #[builder(into)]
    pub parcel_group_key: Option<String>,
    /// Overrides the configured expiration, counted from message creation
    pub expire_after: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SendOptions {
    pub fn with_priority(priority: SendPriority) -> Self {
        Self::builder().priority(priority).build()
    }
}

/// A message held by the message store together with its delivery metadata.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub(crate) message: Message,
    pub(crate) send_priority: SendPriority,
    pub(crate) requires_registration: bool,
    pub(crate) persist: bool,
    pub(crate) message_size: usize,
    pub(crate) parcel_group_key: Option<String>,
    pub(crate) expire_after: Option<Duration>,
    pub(crate) state: MessageState,
    pub(crate) send_attempts: HashMap<String, u32>,
}

impl StoredMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn message_type(&self) -> i32 {
        self.message.message_type
    }

    pub fn send_priority(&self) -> SendPriority {
        self.send_priority
    }

    pub fn requires_registration(&self) -> bool {
        self.requires_registration
    }

    /// Whether the message is written to durable storage.
    pub fn is_persisted(&self) -> bool {
        self.persist
    }

    pub fn message_size(&self) -> usize {
        self.message_size
    }

    pub fn parcel_group_key(&self) -> Option<&str> {
        self.parcel_group_key.as_deref()
    }

    pub fn expire_after(&self) -> Option<Duration> {
        self.expire_after
    }

    pub fn state(&self) -> &MessageState {
        &self.state
    }

    pub fn send_attempts(&self) -> &HashMap<String, u32> {
        &self.send_attempts
    }

    pub fn attempts_with(&self, courier_id: &str) -> u32 {
        self.send_attempts.get(courier_id).copied().unwrap_or(0)
    }

    pub fn total_send_attempts(&self) -> u32 {
        self.send_attempts.values().sum()
    }

    /// Composite key deciding which messages may share a parcel.
    pub(crate) fn parcel_key(&self) -> (Option<String>, Option<String>) {
        (
            self.parcel_group_key.clone(),
            self.state.parcel_sub_group_key().map(str::to_owned),
        )
    }

    pub(crate) fn record_failed_attempt(&mut self, courier_id: &str) {
        *self.send_attempts.entry(courier_id.to_owned()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_priority_order() {
        let mut priorities = vec![
            SendPriority::Soon,
            SendPriority::Whenever,
            SendPriority::Immediate,
            SendPriority::Buffer,
            SendPriority::Late,
        ];
        priorities.sort();

        assert_eq!(
            priorities,
            vec![
                SendPriority::Whenever,
                SendPriority::Buffer,
                SendPriority::Late,
                SendPriority::Soon,
                SendPriority::Immediate,
            ]
        );
        assert_eq!(SendPriority::Late.to_string(), "late");
        assert_eq!("buffer".parse::<SendPriority>().unwrap(), SendPriority::Buffer);
    }

    #[test]
    fn test_wire_form_includes_time() {
        let time = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let message =
            Message::with_id(5, "m1", payload(serde_json::json!({ "a": 1 }))).at(time);

        assert_eq!(
            message.to_json_value(),
            serde_json::json!({ "a": 1, "time": 1_700_000_000_123i64 })
        );
        assert_eq!(message.size(), message.to_json().len());
    }

    #[test]
    fn test_from_serializable_rejects_non_objects() {
        #[derive(Serialize)]
        struct Event {
            name: &'static str,
        }

        let message = Message::from_serializable(3, &Event { name: "open" }).unwrap();
        assert_eq!(message.payload.get("name"), Some(&Value::from("open")));
        assert_eq!(message.message_id.len(), MESSAGE_ID_LENGTH);

        assert!(matches!(
            Message::from_serializable(3, &vec![1, 2, 3]),
            Err(Error::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_state_serialization() {
        let state = MessageState::stored_in_sub_group("abc-1");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "state": "stored", "parcel_subgroup": "abc-1" })
        );

        let in_flight: MessageState = serde_json::from_value(serde_json::json!({
            "state": "in-flight",
            "time": 1_700_000_000_000i64,
            "courier": "fcm",
            "parcel": "p#1",
        }))
        .unwrap();
        assert_eq!(in_flight.in_flight_parcel(), Some("p#1"));

        let legacy: MessageState =
            serde_json::from_value(serde_json::json!({ "state": "stored" })).unwrap();
        assert_eq!(legacy, MessageState::stored());

        assert!(serde_json::from_value::<MessageState>(serde_json::json!({ "state": "lost" }))
            .is_err());
    }

    #[test]
    fn test_send_options_defaults() {
        let options = SendOptions::default();
        assert_eq!(options.priority, SendPriority::Soon);
        assert!(options.persist);
        assert!(options.requires_registration);
        assert!(options.parcel_group_key.is_none());
        assert!(options.expire_after.is_none());

        let grouped = SendOptions::builder().parcel_group_key("g1").build();
        assert_eq!(grouped.parcel_group_key.as_deref(), Some("g1"));
    }
}

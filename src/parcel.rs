//! Parcels: batches of messages sent together in one courier call.

use itertools::Itertools;
use serde_json::{Map, Value};

use crate::{message::Message, utils::generate_id};

const PARCEL_ID_LENGTH: usize = 16;

/// An ordered batch of messages.
///
/// The parcel id has the form `{random}#{count}` where `count` is the number of
/// messages in hexadecimal. Encoding the count lets an ack or error handler know
/// whether the parcel was a single message even after some members have been
/// disposed from the store (e.g. expired).
#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    parcel_id: String,
    messages: Vec<Message>,
}

impl Parcel {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            parcel_id: generate_parcel_id(messages.len()),
            messages,
        }
    }

    pub fn parcel_id(&self) -> &str {
        &self.parcel_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(|m| m.message_id.as_str())
    }

    /// Wire form: messages grouped by type under `t{type}` keys, plus a `types`
    /// list naming those keys.
    pub fn to_json_value(&self) -> Value {
        let mut root = Map::new();

        let groups = self
            .messages
            .iter()
            .into_group_map_by(|m| m.message_type)
            .into_iter()
            .sorted_by_key(|(ty, _)| *ty)
            .map(|(ty, messages)| {
                (
                    format!("t{ty}"),
                    Value::Array(messages.into_iter().map(Message::to_json_value).collect()),
                )
            })
            .collect::<Vec<_>>();

        let keys = groups
            .iter()
            .map(|(key, _)| Value::from(key.clone()))
            .collect::<Vec<_>>();

        root.extend(groups);
        root.insert("types".to_owned(), Value::Array(keys));

        Value::Object(root)
    }
}

/// A parcel together with the envelope metadata sent alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedParcel {
    parcel: Parcel,
    stamp: Map<String, Value>,
}

impl StampedParcel {
    pub fn new(parcel: Parcel, stamp: Map<String, Value>) -> Self {
        Self { parcel, stamp }
    }

    pub fn parcel(&self) -> &Parcel {
        &self.parcel
    }

    pub fn parcel_id(&self) -> &str {
        self.parcel.parcel_id()
    }

    pub fn messages(&self) -> &[Message] {
        self.parcel.messages()
    }

    pub fn stamp(&self) -> &Map<String, Value> {
        &self.stamp
    }

    /// Wire form of the parcel with the stamp fields merged into the root.
    pub fn to_json_value(&self) -> Value {
        let mut value = self.parcel.to_json_value();
        if let Value::Object(root) = &mut value {
            root.extend(self.stamp.clone());
        }
        value
    }

    pub fn to_json(&self) -> String {
        self.to_json_value().to_string()
    }
}

pub fn generate_parcel_id(message_count: usize) -> String {
    let count = format!("{message_count:x}");
    let random_len = PARCEL_ID_LENGTH.saturating_sub(count.len() + 1);
    format!("{}#{count}", generate_id(random_len))
}

/// Extracts the member count encoded in a parcel id.
pub fn message_count_from_id(parcel_id: &str) -> Option<usize> {
    let (_, count) = parcel_id.split_once('#')?;
    usize::from_str_radix(count, 16).ok()
}

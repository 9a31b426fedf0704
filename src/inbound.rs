//! Downstream messages received from the server.
//!
//! Inbound couriers hand received parcels to the post office, which fans their
//! messages out to every subscriber through a [`Mailbox`]. Subscribers either
//! hold a raw [`broadcast::Receiver`], consume a filtered [`Stream`], or register
//! a handler which runs on its own task.
//!
//! # Wire format
//!
//! A downstream parcel is a JSON object with a `message_id` field (the parcel id)
//! and one `t{type}` key per message type, holding either a single message object
//! or a list of them. Every message gets the parcel id written into its own
//! `message_id` field.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tracing::{error, trace, warn};

use crate::error::Error;

pub const MESSAGE_ID_FIELD: &str = "message_id";

const KNOWN_KEYS: &[&str] = &["courier"];
const MAILBOX_CAPACITY: usize = 256;

/// A single message taken out of a downstream parcel.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamMessage {
    /// Id of the parcel the message arrived in
    pub message_id: String,
    pub message_type: i32,
    pub data: Value,
}

impl DownstreamMessage {
    fn new(parcel_id: &str, message_type: i32, mut data: Value) -> Self {
        match &mut data {
            Value::Object(fields) => {
                if fields.contains_key(MESSAGE_ID_FIELD) {
                    warn!(
                        message_type,
                        "Downstream message contains a `message_id` field, it will be replaced with the parcel's id"
                    );
                }
                fields.insert(MESSAGE_ID_FIELD.to_owned(), Value::from(parcel_id));
            }
            other => error!(
                message_type,
                data = %other,
                "Downstream message data was not an object when parsing parcel"
            ),
        }

        Self {
            message_id: parcel_id.to_owned(),
            message_type,
            data,
        }
    }

    /// Deserializes the message data into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// A parcel received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct DownstreamParcel {
    parcel_id: String,
    messages: Vec<DownstreamMessage>,
}

impl DownstreamParcel {
    /// Parses a parcel from its JSON text.
    ///
    /// # Returns
    ///
    /// The parcel, or [`Error::ParcelParse`] if the text is not a JSON object, the
    /// parcel id is missing or a message type key is out of range.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let data = serde_json::from_str::<Map<String, Value>>(json)
            .map_err(|e| Error::parcel_parse(format!("error parsing downstream parcel: {e}")))?;
        Self::try_from(data)
    }

    pub fn parcel_id(&self) -> &str {
        &self.parcel_id
    }

    pub fn messages(&self) -> &[DownstreamMessage] {
        &self.messages
    }
}

impl TryFrom<Map<String, Value>> for DownstreamParcel {
    type Error = Error;

    fn try_from(mut data: Map<String, Value>) -> Result<Self, Error> {
        let parcel_id = match data.remove(MESSAGE_ID_FIELD) {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::String(_)) | Some(Value::Null) | None => {
                return Err(Error::parcel_parse(
                    "missing `message_id` on downstream parcel",
                ))
            }
            Some(other) => {
                return Err(Error::parcel_parse(format!(
                    "`message_id` of downstream parcel must be a string, got {other}"
                )))
            }
        };

        let mut messages = Vec::new();
        let mut unknown_keys = Vec::new();

        for (key, value) in data {
            let Some(message_type) = parse_type_key(&key)? else {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    unknown_keys.push(key);
                }
                continue;
            };

            let items = match value {
                Value::Array(items) => items,
                Value::Null => vec![Value::Object(Map::new())],
                value @ Value::Object(_) => vec![value],
                other => {
                    error!(
                        message_type,
                        data = %other,
                        "Invalid message data received in downstream parcel, it was neither a list nor an object"
                    );
                    continue;
                }
            };

            messages.extend(
                items
                    .into_iter()
                    .filter(|item| !item.is_null())
                    .map(|item| DownstreamMessage::new(&parcel_id, message_type, item)),
            );
        }

        if !unknown_keys.is_empty() {
            warn!(
                ?unknown_keys,
                "Unidentified keys found in downstream parcel, they will be ignored"
            );
        }

        Ok(Self {
            parcel_id,
            messages,
        })
    }
}

/// Message type of a `t{type}` key, `None` for keys of any other shape.
fn parse_type_key(key: &str) -> Result<Option<i32>, Error> {
    match key.strip_prefix('t') {
        Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => digits
            .parse()
            .map(Some)
            .map_err(|_| Error::parcel_parse(format!("invalid message type {key}"))),
        _ => Ok(None),
    }
}

/// Fans received downstream messages out to subscribers.
///
/// Messages delivered while nobody is subscribed are dropped. A subscriber
/// which falls more than a fixed number of messages behind skips the oldest
/// ones.
#[derive(Clone)]
pub struct Mailbox {
    messages: broadcast::Sender<DownstreamMessage>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(MAILBOX_CAPACITY);
        Self { messages }
    }

    /// Hands every message of the parcel to the current subscribers.
    pub fn deliver(&self, parcel: DownstreamParcel) {
        trace!(
            parcel_id = %parcel.parcel_id,
            messages = parcel.messages.len(),
            "Downstream parcel received"
        );

        for message in parcel.messages {
            let message_type = message.message_type;
            if self.messages.send(message).is_err() {
                trace!(message_type, "No subscriber for downstream message");
            }
        }
    }

    /// Subscribes to messages of every type.
    pub fn subscribe(&self) -> broadcast::Receiver<DownstreamMessage> {
        self.messages.subscribe()
    }

    /// Messages of every type, received from the moment this is called.
    pub fn messages(&self) -> impl Stream<Item = DownstreamMessage> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| match item {
            Ok(message) => Some(message),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Downstream message subscriber fell behind, messages were skipped");
                None
            }
        })
    }

    pub fn messages_of_type(
        &self,
        message_type: i32,
    ) -> impl Stream<Item = DownstreamMessage> + Send + 'static {
        self.messages()
            .filter(move |message| message.message_type == message_type)
    }

    /// Messages of the given type deserialized into `T`.
    ///
    /// Messages which fail to deserialize are logged and skipped.
    pub fn parsed_messages<T>(&self, message_type: i32) -> impl Stream<Item = T> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.messages_of_type(message_type)
            .filter_map(move |message| match message.parse::<T>() {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    error!(
                        message_type,
                        message_id = %message.message_id,
                        data = %message.data,
                        ?err,
                        "Could not parse downstream message"
                    );
                    None
                }
            })
    }

    /// Runs `handler` for every received message on a separate task.
    ///
    /// # Arguments
    ///
    /// * `handler` - Called once per message. Returned errors are logged and do
    ///   not end the subscription.
    ///
    /// # Returns
    ///
    /// The handle of the task, which runs until it is aborted or every sender of
    /// the mailbox is dropped.
    pub fn mail_box<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: FnMut(DownstreamMessage) -> eyre::Result<()> + Send + 'static,
    {
        spawn_handler(self.messages(), None, handler)
    }

    /// Like [`Mailbox::mail_box`], for messages of one type only.
    pub fn mail_box_for_type<F>(&self, message_type: i32, handler: F) -> JoinHandle<()>
    where
        F: FnMut(DownstreamMessage) -> eyre::Result<()> + Send + 'static,
    {
        spawn_handler(self.messages_of_type(message_type), Some(message_type), handler)
    }

    /// Like [`Mailbox::mail_box_for_type`], with the messages deserialized into `T`.
    pub fn mail_box_parsed<T, F>(&self, message_type: i32, handler: F) -> JoinHandle<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(T) -> eyre::Result<()> + Send + 'static,
    {
        spawn_handler(self.parsed_messages(message_type), Some(message_type), handler)
    }
}

fn spawn_handler<T, S, F>(stream: S, message_type: Option<i32>, mut handler: F) -> JoinHandle<()>
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
    F: FnMut(T) -> eyre::Result<()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::pin!(stream);
        while let Some(item) = stream.next().await {
            if let Err(err) = handler(item) {
                error!(
                    ?message_type,
                    ?err,
                    "Unhandled error occurred while handling downstream message"
                );
            }
        }
    })
}

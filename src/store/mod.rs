//! The message store: the single source of truth for pending outbound messages.
//!
//! A message can be *stored* (held in memory and available for collection) and,
//! independently, *persisted* (written to durable storage so it survives a
//! restart). Persisted writes are not performed directly: they are queued as
//! pending writes which the post office drains at a limited rate.
//!
//! The store is owned by the post office task and is never shared between
//! threads, so it uses plain collections. Messages added or removed while a
//! caller holds ids from a previous read are buffered and applied on the next
//! [`MessageStore::read_messages`].

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use itertools::Itertools;
use tracing::{debug, error, trace, warn};

use crate::{
    config::Config,
    message::{Message, MessageState, SendOptions, SendPriority, StoredMessage},
    persistence::{PersistOp, Persistence},
};

mod record;

pub use record::PersistedMessage;

#[derive(Debug, Clone)]
enum PendingWrite {
    Save(PersistedMessage),
    Remove(String),
}

impl PendingWrite {
    fn message_id(&self) -> &str {
        match self {
            Self::Save(record) => &record.message_id,
            Self::Remove(id) => id,
        }
    }
}

pub struct MessageStore {
    config: Arc<Config>,
    persistence: Arc<dyn Persistence>,

    /// Messages which were present at the last read
    stored_messages: Vec<StoredMessage>,
    /// Messages added since the last read
    new_messages: Vec<StoredMessage>,
    /// Ids of messages removed since the last read
    removed_messages: HashSet<String>,
    /// Ids of every message currently held, excluding removed ones
    existing_message_ids: HashSet<String>,
    message_count_per_type: HashMap<i32, usize>,

    pending_writes: Vec<PendingWrite>,
}

impl MessageStore {
    pub fn new(config: Arc<Config>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            config,
            persistence,
            stored_messages: Vec::new(),
            new_messages: Vec::new(),
            removed_messages: HashSet::new(),
            existing_message_ids: HashSet::new(),
            message_count_per_type: HashMap::new(),
            pending_writes: Vec::new(),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn len(&self) -> usize {
        self.existing_message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.existing_message_ids.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.existing_message_ids.contains(message_id)
    }

    /// Number of messages of the given type currently held.
    pub fn pending_count(&self, message_type: i32) -> usize {
        self.message_count_per_type
            .get(&message_type)
            .copied()
            .unwrap_or(0)
    }

    /// Adds a message to the store.
    ///
    /// # Arguments
    ///
    /// * `message` - The outbound message. Its id must not be held by the store yet
    /// * `options` - Priority and persistence flags stored along with the message
    ///
    /// # Returns
    ///
    /// The stored message, or `None` without modifying the store if a message
    /// with the same id is already held, or if the pending limit for the
    /// message type has been reached.
    pub fn store_message(
        &mut self,
        message: Message,
        options: &SendOptions,
    ) -> Option<&StoredMessage> {
        if self.contains(&message.message_id) {
            error!(
                message_id = %message.message_id,
                message_type = message.message_type,
                "Attempted to store outbound message with duplicate message id"
            );
            return None;
        }

        let pending = self.pending_count(message.message_type);
        if pending >= self.config.max_pending_for_type(message.message_type) {
            warn!(
                message_type = message.message_type,
                pending,
                "Ignoring outbound message, too many messages of this type are already pending"
            );
            return None;
        }

        // A removed copy with the same id must be dropped before the new one
        // is added, since removals are matched by id.
        if self.removed_messages.contains(&message.message_id) {
            self.commit();
        }

        let stored = StoredMessage {
            message_size: message.size(),
            message,
            send_priority: options.priority,
            requires_registration: options.requires_registration,
            persist: options.persist,
            parcel_group_key: options.parcel_group_key.clone(),
            expire_after: options.expire_after,
            state: MessageState::stored(),
            send_attempts: HashMap::new(),
        };

        trace!(
            message_id = %stored.message_id(),
            message_type = stored.message_type(),
            size = stored.message_size,
            priority = %stored.send_priority,
            "Storing outbound message"
        );

        self.existing_message_ids
            .insert(stored.message_id().to_owned());
        self.increase_message_count(stored.message_type());

        if stored.persist {
            self.pending_writes
                .push(PendingWrite::Save(PersistedMessage::from(&stored)));
        }

        self.new_messages.push(stored);
        self.new_messages.last()
    }

    /// Every message held by the store, regardless of its state, in insertion
    /// order.
    ///
    /// Buffered additions and removals are applied before the snapshot is
    /// taken.
    pub fn read_messages(&mut self) -> std::slice::Iter<'_, StoredMessage> {
        self.commit();
        self.stored_messages.iter()
    }

    pub fn get(&self, message_id: &str) -> Option<&StoredMessage> {
        if !self.contains(message_id) {
            return None;
        }
        self.stored_messages
            .iter()
            .chain(self.new_messages.iter())
            .find(|m| m.message_id() == message_id)
    }

    fn get_mut(&mut self, message_id: &str) -> Option<&mut StoredMessage> {
        if !self.existing_message_ids.contains(message_id) {
            return None;
        }
        self.stored_messages
            .iter_mut()
            .chain(self.new_messages.iter_mut())
            .find(|m| m.message_id() == message_id)
    }

    /// Changes the state of a held message. Returns `false` if the message is
    /// no longer in the store.
    pub fn update_state(&mut self, message_id: &str, state: MessageState, persist: bool) -> bool {
        let Some(stored) = self.get_mut(message_id) else {
            return false;
        };

        stored.state = state;
        let record = (persist && stored.persist).then(|| PersistedMessage::from(&*stored));

        if let Some(record) = record {
            self.pending_writes.push(PendingWrite::Save(record));
        }
        true
    }

    /// Counts a failed send attempt of the message through the given courier.
    pub fn record_failed_attempt(&mut self, message_id: &str, courier_id: &str) -> bool {
        let Some(stored) = self.get_mut(message_id) else {
            return false;
        };

        stored.record_failed_attempt(courier_id);
        let record = stored.persist.then(|| PersistedMessage::from(&*stored));

        if let Some(record) = record {
            self.pending_writes.push(PendingWrite::Save(record));
        }
        true
    }

    /// Queues a write of the message to durable storage.
    ///
    /// With `insert_if_not_exist` unset the write is skipped if the message is
    /// no longer held by the store.
    pub fn persist_message(&mut self, stored: &StoredMessage, insert_if_not_exist: bool) -> bool {
        if !insert_if_not_exist && !self.contains(stored.message_id()) {
            return false;
        }

        self.pending_writes
            .push(PendingWrite::Save(PersistedMessage::from(stored)));
        true
    }

    /// Removes a message from the store and from durable storage.
    ///
    /// The message disappears from [`MessageStore::get`] and the per-type
    /// counts immediately; it is dropped from the message list on the next read.
    pub fn remove_message(&mut self, message_id: &str) -> bool {
        if !self.existing_message_ids.remove(message_id) {
            return false;
        }

        let message_type = self
            .stored_messages
            .iter()
            .chain(self.new_messages.iter())
            .find(|m| m.message_id() == message_id)
            .map(StoredMessage::message_type);

        if let Some(message_type) = message_type {
            self.decrease_message_count(message_type);
        }

        self.removed_messages.insert(message_id.to_owned());
        self.pending_writes
            .push(PendingWrite::Remove(message_id.to_owned()));
        true
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.pending_writes.is_empty()
    }

    /// Drains the queued writes, keeping only the last write per message.
    pub fn take_pending_writes(&mut self) -> Vec<PersistOp> {
        let writes = std::mem::take(&mut self.pending_writes);

        let mut latest = writes
            .into_iter()
            .rev()
            .unique_by(|w| w.message_id().to_owned())
            .collect::<Vec<_>>();
        latest.reverse();

        latest
            .into_iter()
            .filter_map(|write| match write {
                PendingWrite::Save(record) => match serde_json::to_string(&record) {
                    Ok(json) => Some(PersistOp::Put {
                        key: record.message_id,
                        record: json,
                    }),
                    Err(err) => {
                        error!(message_id = %record.message_id, ?err, "Failed to serialize outbound message");
                        None
                    }
                },
                PendingWrite::Remove(key) => Some(PersistOp::Delete { key }),
            })
            .collect()
    }

    /// Loads persisted messages into the store.
    ///
    /// Returns the highest priority among the restored messages, or `None` if
    /// nothing could be restored.
    pub async fn restore_messages(&mut self) -> Option<SendPriority> {
        let entries = match self.persistence.get_all().await {
            Ok(entries) => entries,
            Err(err) => {
                error!(?err, "Failed to read persisted outbound messages");
                return None;
            }
        };

        self.restore_from(entries)
    }

    pub(crate) fn restore_from(&mut self, entries: HashMap<String, String>) -> Option<SendPriority> {
        if entries.is_empty() {
            return None;
        }

        self.commit();

        let mut errored_keys = Vec::new();
        let mut recovered = Vec::new();

        for (key, json) in entries {
            if json.trim().is_empty() {
                errored_keys.push(key);
                continue;
            }

            match serde_json::from_str::<PersistedMessage>(&json) {
                Ok(record) => recovered.push(record.into_stored()),
                Err(err) => {
                    warn!(%key, ?err, data = %json, "Unable to recover persisted outbound message");
                    errored_keys.push(key);
                }
            }
        }

        recovered.sort_by_key(|m| m.message.time);

        let mut highest_priority = None;
        let mut restored = 0;

        for stored in recovered {
            if !self
                .existing_message_ids
                .insert(stored.message_id().to_owned())
            {
                continue;
            }

            self.increase_message_count(stored.message_type());
            highest_priority = highest_priority.max(Some(stored.send_priority));
            restored += 1;
            self.new_messages.push(stored);
        }

        for key in errored_keys {
            self.pending_writes.push(PendingWrite::Remove(key));
        }

        debug!(
            restored,
            priority = ?highest_priority,
            types = ?self.message_count_per_type,
            "Restored pending outbound messages"
        );

        highest_priority
    }

    fn commit(&mut self) {
        if !self.new_messages.is_empty() {
            self.stored_messages.append(&mut self.new_messages);
        }

        if !self.removed_messages.is_empty() {
            let removed = std::mem::take(&mut self.removed_messages);
            self.stored_messages
                .retain(|m| !removed.contains(m.message_id()));
        }
    }

    fn increase_message_count(&mut self, message_type: i32) {
        *self.message_count_per_type.entry(message_type).or_insert(0) += 1;
    }

    fn decrease_message_count(&mut self, message_type: i32) {
        if let Some(count) = self.message_count_per_type.get_mut(&message_type) {
            *count = count.saturating_sub(1);
        }
    }
}

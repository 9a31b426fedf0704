//! The post office: accepts outbound messages, decides when a drain should run
//! and assembles parcels out of the stored messages.
//!
//! All state lives in a single task which owns the [`MessageStore`]. The
//! [`PostOffice`] type is a cheap handle onto that task; every operation is
//! sent to it as a command and executed in order. Courier calls and
//! persistence writes run on other tasks and report back through the same
//! command channel, so the store is never touched concurrently.
//!
//! Downstream parcels go the other way: they never touch the store and are
//! handed straight to the subscribers of the post office's [`Mailbox`].

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::error;

use crate::{
    config::Config,
    courier::CourierError,
    error::Error,
    inbound::{DownstreamMessage, DownstreamParcel, Mailbox, MESSAGE_ID_FIELD},
    message::{Message, SendOptions, StoredMessage, MESSAGE_ID_LENGTH},
    parcel::StampedParcel,
    persistence::Persistence,
    registration::RegistrationGate,
    scheduler::TaskScheduler,
    stamp::ParcelStamper,
    store::MessageStore,
    utils::generate_id,
};

mod timers;
mod worker;

use timers::TimerKey;
use worker::Worker;

pub(crate) enum Command {
    SendMessage {
        message: Message,
        options: SendOptions,
    },
    CollectParcels {
        reply: oneshot::Sender<Vec<StampedParcel>>,
    },
    ParcelInFlight {
        parcel_id: String,
        message_ids: Vec<String>,
        courier_id: String,
    },
    ParcelAck {
        parcel_id: String,
        courier_id: String,
    },
    ParcelError {
        parcel_id: String,
        courier_id: String,
        error: CourierError,
    },
    CheckInFlightTimeouts {
        reply: oneshot::Sender<usize>,
    },
    CheckExpirations {
        reply: oneshot::Sender<usize>,
    },
    AreMessagesInFlight {
        reply: oneshot::Sender<bool>,
    },
    ReadMessages {
        reply: oneshot::Sender<Vec<StoredMessage>>,
    },
    FlushPersistence {
        reply: oneshot::Sender<()>,
    },
    RegistrationComplete,
    TimerFired {
        key: TimerKey,
        generation: u64,
    },
}

/// Handle onto the running post office.
///
/// The post office task stops once every handle has been dropped.
#[derive(Clone)]
pub struct PostOffice {
    commands: mpsc::UnboundedSender<Command>,
    mailbox: Mailbox,
}

#[bon::bon]
impl PostOffice {
    /// Starts the post office task.
    ///
    /// Persisted messages are restored before any other operation is handled.
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - Limits and timeouts applied to stored messages
    /// * `persistence` - Durable storage the messages are restored from and written to
    /// * `stamper` - Adds the envelope metadata to collected parcels
    /// * `scheduler` - Receives the drain requests triggered by stored messages
    /// * `registration` - Gate holding back messages which require registration.
    ///   Defaults to a gate which never completes.
    ///
    /// # Returns
    ///
    /// A handle onto the running post office. The task stops once every clone
    /// of the handle has been dropped.
    #[builder(finish_fn = start)]
    pub fn spawn(
        #[builder(into)] config: Arc<Config>,
        persistence: Arc<dyn Persistence>,
        stamper: ParcelStamper,
        scheduler: Arc<dyn TaskScheduler>,
        #[builder(default)] registration: RegistrationGate,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();

        let store = MessageStore::new(config.clone(), persistence);
        let worker = Worker::new(
            config,
            store,
            stamper,
            scheduler,
            registration.is_complete(),
            commands.downgrade(),
        );

        if !registration.is_complete() {
            let commands = commands.downgrade();
            tokio::spawn(async move {
                registration.wait().await;
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::RegistrationComplete);
                }
            });
        }

        tokio::spawn(worker.run(rx));

        Self {
            commands,
            mailbox: Mailbox::new(),
        }
    }
}

impl PostOffice {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply))?;
        Ok(rx.await?)
    }

    /// Hands a message to the post office. Never fails: rejected messages
    /// are only logged.
    pub fn send_message(&self, message: Message, options: SendOptions) {
        let message_id = message.message_id.clone();
        if self
            .commands
            .send(Command::SendMessage { message, options })
            .is_err()
        {
            error!(%message_id, "Post office is no longer running, dropping outbound message");
        }
    }

    /// Groups the stored messages which may be sent now into stamped parcels.
    pub async fn collect_parcels_for_sending(&self) -> Result<Vec<StampedParcel>, Error> {
        self.request(|reply| Command::CollectParcels { reply }).await
    }

    /// Marks every member of the parcel as in flight with the given courier.
    pub fn on_parcel_in_flight(&self, parcel: &StampedParcel, courier_id: &str) -> Result<(), Error> {
        self.commands.send(Command::ParcelInFlight {
            parcel_id: parcel.parcel_id().to_owned(),
            message_ids: parcel.parcel().message_ids().map(str::to_owned).collect(),
            courier_id: courier_id.to_owned(),
        })?;
        Ok(())
    }

    pub fn on_parcel_ack(&self, parcel_id: &str, courier_id: &str) -> Result<(), Error> {
        self.commands.send(Command::ParcelAck {
            parcel_id: parcel_id.to_owned(),
            courier_id: courier_id.to_owned(),
        })?;
        Ok(())
    }

    pub fn on_parcel_error(
        &self,
        parcel_id: &str,
        courier_id: &str,
        error: CourierError,
    ) -> Result<(), Error> {
        self.commands.send(Command::ParcelError {
            parcel_id: parcel_id.to_owned(),
            courier_id: courier_id.to_owned(),
            error,
        })?;
        Ok(())
    }

    /// Puts messages which have been in flight for too long back into the
    /// stored state, counting a failed attempt. Returns how many timed out.
    pub async fn check_in_flight_message_timeouts(&self) -> Result<usize, Error> {
        self.request(|reply| Command::CheckInFlightTimeouts { reply })
            .await
    }

    /// Disposes stored messages which have expired. Returns how many expired.
    pub async fn check_message_expirations(&self) -> Result<usize, Error> {
        self.request(|reply| Command::CheckExpirations { reply }).await
    }

    pub async fn are_messages_in_flight(&self) -> Result<bool, Error> {
        self.request(|reply| Command::AreMessagesInFlight { reply })
            .await
    }

    /// Snapshot of every message currently held by the store.
    pub async fn read_messages(&self) -> Result<Vec<StoredMessage>, Error> {
        self.request(|reply| Command::ReadMessages { reply }).await
    }

    /// Writes all pending store changes to persistence and waits for them to
    /// be applied.
    pub async fn flush_persistence(&self) -> Result<(), Error> {
        self.request(|reply| Command::FlushPersistence { reply })
            .await
    }

    /// Called by inbound couriers whenever a parcel has been received.
    pub fn on_inbound_parcel_received(&self, parcel: DownstreamParcel) {
        self.mailbox.deliver(parcel);
    }

    /// Delivers a parcel produced locally instead of by a courier.
    ///
    /// # Arguments
    ///
    /// * `parcel_data` - The parcel in its wire form
    /// * `default_message_id` - Parcel id used if `parcel_data` has none. A random
    ///   id is generated if this is `None` as well.
    ///
    /// # Returns
    ///
    /// [`Error::ParcelParse`] if the data is not a valid downstream parcel, in
    /// which case nothing is delivered.
    pub fn handle_local_parcel(
        &self,
        mut parcel_data: Map<String, Value>,
        default_message_id: Option<&str>,
    ) -> Result<(), Error> {
        if !parcel_data.contains_key(MESSAGE_ID_FIELD) {
            let parcel_id = default_message_id
                .map(str::to_owned)
                .unwrap_or_else(|| generate_id(MESSAGE_ID_LENGTH));
            parcel_data.insert(MESSAGE_ID_FIELD.to_owned(), Value::from(parcel_id));
        }

        let parcel = DownstreamParcel::try_from(parcel_data)?;
        self.mailbox.deliver(parcel);
        Ok(())
    }

    /// Subscribes to downstream messages of every type.
    pub fn receive_messages(&self) -> broadcast::Receiver<DownstreamMessage> {
        self.mailbox.subscribe()
    }

    /// The mailbox downstream messages are delivered to, for filtered, typed
    /// and handler based subscriptions.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}

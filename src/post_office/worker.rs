use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use itertools::Itertools;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::{
    config::Config,
    courier::CourierError,
    message::{Message, MessageState, SendOptions, SendPriority, StoredMessage},
    parcel::{message_count_from_id, Parcel, StampedParcel},
    persistence::{PersistOp, Persistence},
    scheduler::TaskScheduler,
    stamp::ParcelStamper,
    store::MessageStore,
    utils::generate_id,
};

use super::{
    timers::{TimerKey, Timers},
    Command,
};

const SOON_DEBOUNCE: Duration = Duration::from_secs(2);
const LATE_DEBOUNCE: Duration = Duration::from_secs(3 * 60);
const BUFFER_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const PERSIST_WRITE_DELAY: Duration = Duration::from_secs(1);
const TOO_BIG_RETRY_DELAY: Duration = Duration::from_secs(1);
const FAIL_RETRY_COALESCE: Duration = Duration::from_secs(1);

const MAX_BACKOFF_EXPONENT: u32 = 16;
const SUB_GROUP_ID_LENGTH: usize = 5;

/// What caused a drain to be requested.
#[derive(Debug, Clone, Copy)]
struct Signal {
    priority: SendPriority,
    requires_registration: bool,
}

struct PersistBatch {
    ops: Vec<PersistOp>,
    done: Option<oneshot::Sender<()>>,
}

pub(super) struct Worker {
    config: Arc<Config>,
    store: MessageStore,
    stamper: ParcelStamper,
    scheduler: Arc<dyn TaskScheduler>,
    timers: Timers,
    writer: mpsc::UnboundedSender<PersistBatch>,

    registered: bool,
    schedule_on_registration: bool,

    soon_signal: Option<Signal>,
    late_signal: Option<Signal>,
    fail_backoff: Option<Duration>,
}

impl Worker {
    pub fn new(
        config: Arc<Config>,
        store: MessageStore,
        stamper: ParcelStamper,
        scheduler: Arc<dyn TaskScheduler>,
        registered: bool,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let (writer, batches) = mpsc::unbounded_channel();
        tokio::spawn(write_batches(store.persistence().clone(), batches));

        Self {
            config,
            store,
            stamper,
            scheduler,
            timers: Timers::new(commands),
            writer,
            registered,
            schedule_on_registration: false,
            soon_signal: None,
            late_signal: None,
            fail_backoff: None,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if let Some(priority) = self.store.restore_messages().await {
            debug!(%priority, count = self.store.len(), "Scheduling restored outbound messages");
            self.signal(Signal {
                priority,
                requires_registration: true,
            });
        }
        self.schedule_persist_write();

        while let Some(command) = commands.recv().await {
            self.handle(command);
            self.schedule_persist_write();
        }

        self.write_pending(None);
        debug!("Post office stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SendMessage { message, options } => self.send_message(message, options),
            Command::CollectParcels { reply } => {
                let _ = reply.send(self.collect_parcels_for_sending());
            }
            Command::ParcelInFlight {
                parcel_id,
                message_ids,
                courier_id,
            } => self.on_parcel_in_flight(&parcel_id, &message_ids, &courier_id),
            Command::ParcelAck {
                parcel_id,
                courier_id,
            } => self.on_parcel_ack(&parcel_id, &courier_id),
            Command::ParcelError {
                parcel_id,
                courier_id,
                error,
            } => self.on_parcel_error(&parcel_id, &courier_id, error),
            Command::CheckInFlightTimeouts { reply } => {
                let _ = reply.send(self.check_in_flight_message_timeouts());
            }
            Command::CheckExpirations { reply } => {
                let _ = reply.send(self.check_message_expirations());
            }
            Command::AreMessagesInFlight { reply } => {
                let in_flight = self
                    .store
                    .read_messages()
                    .any(|m| m.state().is_in_flight());
                let _ = reply.send(in_flight);
            }
            Command::ReadMessages { reply } => {
                let _ = reply.send(self.store.read_messages().cloned().collect());
            }
            Command::FlushPersistence { reply } => {
                self.timers.cancel(TimerKey::PersistWrite);
                self.write_pending(Some(reply));
            }
            Command::RegistrationComplete => self.on_registration_complete(),
            Command::TimerFired { key, generation } => {
                if self.timers.fire(key, generation) {
                    self.on_timer(key);
                }
            }
        }
    }

    fn send_message(&mut self, message: Message, mut options: SendOptions) {
        if options.persist && !options.requires_registration {
            warn!(
                message_id = %message.message_id,
                message_type = message.message_type,
                "Persisting outbound messages is not supported for messages that do not require registration"
            );
            options.persist = false;
        }

        let Some(stored) = self.store.store_message(message, &options) else {
            return;
        };

        let signal = Signal {
            priority: stored.send_priority(),
            requires_registration: stored.requires_registration(),
        };
        self.signal(signal);
    }

    fn signal(&mut self, signal: Signal) {
        match signal.priority {
            SendPriority::Immediate => self.schedule_sender(Some(signal), None),
            SendPriority::Soon => {
                self.soon_signal = Some(signal);
                self.timers.debounce(TimerKey::Soon, SOON_DEBOUNCE);
            }
            SendPriority::Late => {
                self.late_signal = Some(signal);
                self.timers.debounce(TimerKey::Late, LATE_DEBOUNCE);
            }
            SendPriority::Buffer | SendPriority::Whenever => {
                self.timers.throttle(TimerKey::Buffer, BUFFER_SAMPLE_INTERVAL);
            }
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Soon => {
                if let Some(signal) = self.soon_signal.take() {
                    self.schedule_sender(Some(signal), None);
                }
            }
            TimerKey::Late => {
                if let Some(signal) = self.late_signal.take() {
                    self.schedule_sender(Some(signal), None);
                }
            }
            TimerKey::Buffer => {
                if self.is_full_parcel_ready() {
                    trace!("Full parcel available for sending, triggering drain");
                    self.schedule_sender(None, None);
                }
            }
            TimerKey::PersistWrite => self.write_pending(None),
            TimerKey::TooBigRetry => self.schedule_sender(None, None),
            TimerKey::FailRetry => {
                if let Some(delay) = self.fail_backoff.take() {
                    debug!(?delay, "Scheduling drain to resend failed messages");
                    self.schedule_sender(None, Some(delay));
                }
            }
        }
    }

    /// Requests a drain. Drains triggered by a message which waits for
    /// registration are held back until registration completes.
    fn schedule_sender(&mut self, signal: Option<Signal>, delay: Option<Duration>) {
        match signal {
            Some(signal) if signal.requires_registration && !self.registered => {
                trace!(priority = %signal.priority, "Drain deferred until registration completes");
                self.schedule_on_registration = true;
            }
            _ => self.scheduler.schedule_drain(delay),
        }
    }

    fn on_registration_complete(&mut self) {
        if self.registered {
            return;
        }
        self.registered = true;

        if std::mem::take(&mut self.schedule_on_registration) {
            debug!("Registration complete, scheduling deferred drain");
            self.scheduler.schedule_drain(None);
        }
    }

    fn is_full_parcel_ready(&mut self) -> bool {
        let registered = self.registered;
        let (total_size, buffered) = self
            .store
            .read_messages()
            .filter(|m| m.state().is_stored())
            .filter(|m| registered || !m.requires_registration())
            .fold((0, false), |(size, buffered), m| {
                (
                    size + m.message_size(),
                    buffered || m.send_priority() == SendPriority::Buffer,
                )
            });

        buffered && total_size >= self.config.max_parcel_size()
    }

    fn collect_parcels_for_sending(&mut self) -> Vec<StampedParcel> {
        let max_parcel_size = self.config.max_parcel_size();
        let registered = self.registered;

        let groups = self
            .store
            .read_messages()
            .filter(|m| registered || !m.requires_registration())
            .filter(|m| m.state().is_stored())
            .into_group_map_by(|m| m.parcel_key());

        let stamper = &self.stamper;
        groups
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .flat_map(|(_, messages)| pack_messages(messages, max_parcel_size))
            .filter(|messages| !messages.is_empty())
            .map(|messages| stamper.stamp_parcel(Parcel::new(messages)))
            .collect()
    }

    fn parcel_members(&mut self, parcel_id: &str) -> Vec<String> {
        self.store
            .read_messages()
            .filter(|m| m.state().in_flight_parcel() == Some(parcel_id))
            .map(|m| m.message_id().to_owned())
            .collect()
    }

    fn on_parcel_in_flight(&mut self, parcel_id: &str, message_ids: &[String], courier_id: &str) {
        let state = MessageState::InFlight {
            timestamp: Utc::now(),
            courier: courier_id.to_owned(),
            parcel_id: parcel_id.to_owned(),
        };

        for message_id in message_ids {
            self.store.update_state(message_id, state.clone(), true);
        }
    }

    fn on_parcel_ack(&mut self, parcel_id: &str, courier_id: &str) {
        let sent = self.parcel_members(parcel_id);

        debug!(
            parcel_id,
            courier = courier_id,
            messages = sent.len(),
            "Parcel successfully sent"
        );

        let state = MessageState::Sent {
            parcel_id: parcel_id.to_owned(),
            courier: courier_id.to_owned(),
        };
        for message_id in sent {
            self.store.update_state(&message_id, state.clone(), false);
            self.store.remove_message(&message_id);
        }
    }

    fn on_parcel_error(&mut self, parcel_id: &str, courier_id: &str, error: CourierError) {
        let members = self.parcel_members(parcel_id);

        // The count encoded in the id still holds if some members have expired
        // since the parcel was assembled.
        let original_count = message_count_from_id(parcel_id)
            .filter(|count| *count > 0)
            .unwrap_or(members.len());

        if error.is_too_big() {
            self.split_parcel(parcel_id, courier_id, members, original_count, &error);
        } else {
            self.retry_parcel(parcel_id, courier_id, members, original_count, &error);
        }
    }

    fn split_parcel(
        &mut self,
        parcel_id: &str,
        courier_id: &str,
        members: Vec<String>,
        original_count: usize,
        error: &CourierError,
    ) {
        if members.is_empty() {
            error!(
                parcel_id,
                original_count,
                %error,
                "Parcel is too big error received for parcel that does not exist"
            );
            return;
        }

        if original_count == 1 {
            let first = self.store.get(&members[0]);
            error!(
                courier = courier_id,
                parcel_id,
                message_type = ?first.map(StoredMessage::message_type),
                message_size = ?first.map(StoredMessage::message_size),
                %error,
                "Parcel is too big for courier but cannot be split any further"
            );

            // The message is dropped for every courier, not just this one.
            for message_id in &members {
                self.store.remove_message(message_id);
            }
            return;
        }

        let group = generate_id(SUB_GROUP_ID_LENGTH);
        let first_state = MessageState::stored_in_sub_group(format!("{group}-1"));
        let second_state = MessageState::stored_in_sub_group(format!("{group}-2"));

        let first_half = members.len().div_ceil(2);
        for (i, message_id) in members.iter().enumerate() {
            let state = if i < first_half {
                first_state.clone()
            } else {
                second_state.clone()
            };
            self.store.update_state(message_id, state, true);
        }

        debug!(
            parcel_id,
            messages = members.len(),
            original_count,
            "Splitting large parcel in to two smaller parcels"
        );

        self.timers
            .debounce(TimerKey::TooBigRetry, TOO_BIG_RETRY_DELAY);
    }

    fn retry_parcel(
        &mut self,
        parcel_id: &str,
        courier_id: &str,
        members: Vec<String>,
        original_count: usize,
        error: &CourierError,
    ) {
        warn!(
            courier = courier_id,
            parcel_id,
            messages = members.len(),
            original_count,
            %error,
            "Parcel sending failed"
        );

        let mut min_backoff: Option<Duration> = None;
        for message_id in &members {
            self.store.record_failed_attempt(message_id, courier_id);
            self.store
                .update_state(message_id, MessageState::stored(), true);

            let attempts = self
                .store
                .get(message_id)
                .map(|m| m.attempts_with(courier_id))
                .unwrap_or(0);
            let backoff = failure_backoff(attempts);
            min_backoff = Some(min_backoff.map_or(backoff, |b| b.min(backoff)));
        }

        let backoff = min_backoff.unwrap_or_else(|| failure_backoff(0));
        self.fail_backoff = Some(self.fail_backoff.map_or(backoff, |b| b.min(backoff)));
        self.timers
            .debounce(TimerKey::FailRetry, FAIL_RETRY_COALESCE);
    }

    fn check_in_flight_message_timeouts(&mut self) -> usize {
        let now = Utc::now();
        let timeout = TimeDelta::from_std(self.config.message_timeout()).unwrap_or(TimeDelta::MAX);

        let timed_out = self
            .store
            .read_messages()
            .filter_map(|m| match m.state() {
                MessageState::InFlight {
                    timestamp, courier, ..
                } if (now - *timestamp).abs() >= timeout => {
                    Some((m.message_id().to_owned(), courier.clone()))
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        for (message_id, courier) in &timed_out {
            self.store.record_failed_attempt(message_id, courier);
            self.store
                .update_state(message_id, MessageState::stored(), true);
        }

        if !timed_out.is_empty() {
            warn!(
                count = timed_out.len(),
                "In-flight messages have timed out and will be sent again"
            );
        }

        timed_out.len()
    }

    fn check_message_expirations(&mut self) -> usize {
        let now = Utc::now();
        let default_expiration = self.config.message_expiration();

        let expired = self
            .store
            .read_messages()
            .filter(|m| m.state().is_stored())
            .filter(|m| {
                let limit = m.expire_after().unwrap_or(default_expiration);
                let limit = TimeDelta::from_std(limit).unwrap_or(TimeDelta::MAX);
                now - m.message().time >= limit
            })
            .map(|m| m.message_id().to_owned())
            .collect::<Vec<_>>();

        for message_id in &expired {
            trace!(message_id = %message_id, "Outbound message has expired, disposing message");
            self.store.remove_message(message_id);
        }

        if !expired.is_empty() {
            warn!(count = expired.len(), "Outbound messages have expired");
        }

        expired.len()
    }

    fn schedule_persist_write(&mut self) {
        if self.store.has_pending_writes() {
            self.timers
                .throttle(TimerKey::PersistWrite, PERSIST_WRITE_DELAY);
        }
    }

    fn write_pending(&mut self, done: Option<oneshot::Sender<()>>) {
        let ops = self.store.take_pending_writes();
        if ops.is_empty() && done.is_none() {
            return;
        }

        if self.writer.send(PersistBatch { ops, done }).is_err() {
            error!("Persistence writer has stopped, dropping message store changes");
        }
    }
}

/// Retry delay after a failed send, from the number of failed attempts with
/// the courier.
fn failure_backoff(attempts: u32) -> Duration {
    let exponent = attempts.saturating_add(2).min(MAX_BACKOFF_EXPONENT);
    Duration::from_secs(2u64.pow(exponent))
}

/// Packs the messages of one group into parcels in order. A parcel is closed
/// before a message which would push it over the size limit; a message which
/// exceeds the limit on its own gets a parcel to itself.
fn pack_messages(messages: Vec<&StoredMessage>, max_parcel_size: usize) -> Vec<Vec<Message>> {
    let mut parcels = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0;

    for stored in messages {
        if !current.is_empty() && current_size + stored.message_size() > max_parcel_size {
            parcels.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += stored.message_size();
        current.push(stored.message().clone());
    }

    if !current.is_empty() {
        parcels.push(current);
    }
    parcels
}

async fn write_batches(
    persistence: Arc<dyn Persistence>,
    mut batches: mpsc::UnboundedReceiver<PersistBatch>,
) {
    while let Some(PersistBatch { ops, done }) = batches.recv().await {
        if !ops.is_empty() {
            trace!(changes = ops.len(), "Persisting changes in message store");
            if let Err(err) = persistence.apply(ops).await {
                error!(?err, "Failed to persist message store changes");
            }
        }

        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

use std::{collections::HashMap, time::Duration};

use tokio::sync::mpsc::WeakUnboundedSender;

use super::Command;

/// Delayed actions of the post office.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    /// Debounced trigger for `Soon` messages
    Soon,
    /// Debounced trigger for `Late` messages
    Late,
    /// Sampling of the full-parcel condition for `Buffer` and `Whenever` messages
    Buffer,
    /// Coalesced write of the pending persistence changes
    PersistWrite,
    /// Retry after a parcel was split
    TooBigRetry,
    /// Retry after a courier failure
    FailRetry,
}

/// Timers which post a [`Command::TimerFired`] back to the post office task.
///
/// Every arming of a key bumps its generation; a firing whose generation is not
/// the latest one for its key is stale and ignored. Restarting a timer is thus
/// just arming it again.
pub(crate) struct Timers {
    commands: WeakUnboundedSender<Command>,
    generations: HashMap<TimerKey, u64>,
    pending: HashMap<TimerKey, u64>,
}

impl Timers {
    pub fn new(commands: WeakUnboundedSender<Command>) -> Self {
        Self {
            commands,
            generations: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Arms the timer, discarding any firing which is still pending.
    pub fn debounce(&mut self, key: TimerKey, delay: Duration) {
        let generation = self.generations.entry(key).or_insert(0);
        *generation += 1;
        let generation = *generation;

        self.pending.insert(key, generation);

        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TimerFired { key, generation });
            }
        });
    }

    /// Arms the timer unless it is already pending. Returns whether the timer
    /// was armed.
    pub fn throttle(&mut self, key: TimerKey, delay: Duration) -> bool {
        if self.is_pending(key) {
            return false;
        }
        self.debounce(key, delay);
        true
    }

    /// Disarms a pending timer so that its firing is ignored.
    pub fn cancel(&mut self, key: TimerKey) {
        if self.pending.remove(&key).is_some() {
            *self.generations.entry(key).or_insert(0) += 1;
        }
    }

    pub fn is_pending(&self, key: TimerKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Handles a firing. Returns `true` if it is the latest arming of the key,
    /// in which case the timer is no longer pending.
    pub fn fire(&mut self, key: TimerKey, generation: u64) -> bool {
        match self.pending.get(&key) {
            Some(pending) if *pending == generation => {
                self.pending.remove(&key);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn next_fired(rx: &mut mpsc::UnboundedReceiver<Command>) -> (TimerKey, u64) {
        match rx.recv().await {
            Some(Command::TimerFired { key, generation }) => (key, generation),
            _ => panic!("expected a timer firing"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keeps_latest_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx.downgrade());

        timers.debounce(TimerKey::Soon, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        timers.debounce(TimerKey::Soon, Duration::from_secs(2));

        let (key, generation) = next_fired(&mut rx).await;
        assert!(!timers.fire(key, generation));
        assert!(timers.is_pending(TimerKey::Soon));

        let (key, generation) = next_fired(&mut rx).await;
        assert!(timers.fire(key, generation));
        assert!(!timers.is_pending(TimerKey::Soon));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_ignores_rearming() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx.downgrade());

        assert!(timers.throttle(TimerKey::PersistWrite, Duration::from_secs(1)));
        assert!(!timers.throttle(TimerKey::PersistWrite, Duration::from_secs(1)));

        let (key, generation) = next_fired(&mut rx).await;
        assert!(timers.fire(key, generation));
        assert!(timers.throttle(TimerKey::PersistWrite, Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx.downgrade());

        timers.debounce(TimerKey::TooBigRetry, Duration::from_secs(1));
        timers.cancel(TimerKey::TooBigRetry);

        let (key, generation) = next_fired(&mut rx).await;
        assert!(!timers.fire(key, generation));
    }
}

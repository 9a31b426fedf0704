//! Scheduling of drains: runs of the upstream sender which deliver whatever
//! the post office has ready.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::{config::Config, error::Error, sender::UpstreamSender};

const MAX_DRAIN_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);

/// Accepts requests to run a drain, now or after a delay.
///
/// Requests are fire-and-forget.
pub trait TaskScheduler: Send + Sync + 'static {
    fn schedule_drain(&self, delay: Option<Duration>);
}

/// [`TaskScheduler`] running drains on the tokio runtime.
#[derive(Clone)]
pub struct DrainScheduler {
    requests: mpsc::UnboundedSender<Option<Duration>>,
}

/// Receiving side of a [`DrainScheduler`], turned into the drain loop with
/// [`DrainRequests::run`]. Created with [`DrainScheduler::channel`].
pub struct DrainRequests {
    requests: mpsc::UnboundedReceiver<Option<Duration>>,
}

impl DrainScheduler {
    pub fn channel() -> (Self, DrainRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { requests: tx }, DrainRequests { requests: rx })
    }
}

impl TaskScheduler for DrainScheduler {
    fn schedule_drain(&self, delay: Option<Duration>) {
        trace!(?delay, "Drain requested");
        let _ = self.requests.send(delay);
    }
}

impl DrainRequests {
    /// Runs drains until `cancel` fires or every [`DrainScheduler`] is dropped.
    ///
    /// Only one drain runs at a time. A new request replaces the pending one.
    /// A failed drain is retried after a backoff which starts at the configured
    /// sender backoff and doubles with every consecutive failure.
    pub async fn run(
        mut self,
        sender: UpstreamSender,
        config: Arc<Config>,
        cancel: CancellationToken,
    ) {
        let base_backoff = config.sender_backoff();
        let mut backoff = base_backoff;
        let mut deadline: Option<Instant> = None;

        let flush_interval = config.flush_interval();
        let mut flush = time::interval_at(Instant::now() + flush_interval, flush_interval);
        flush.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        info!("Drain scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(delay) => deadline = Some(Instant::now() + delay.unwrap_or_default()),
                    None => break,
                },
                _ = flush.tick() => {
                    trace!("Periodic flush");
                    deadline = Some(Instant::now());
                }
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;

                    match drain(&sender).await {
                        Ok(true) => backoff = base_backoff,
                        Ok(false) => {
                            debug!(?backoff, "Drain did not complete, retrying later");
                            deadline = Some(Instant::now() + backoff);
                            backoff = (backoff * 2).min(MAX_DRAIN_BACKOFF);
                        }
                        Err(Error::PostOfficeClosed) => break,
                        Err(err) => {
                            error!(?err, "Drain failed");
                            deadline = Some(Instant::now() + backoff);
                            backoff = (backoff * 2).min(MAX_DRAIN_BACKOFF);
                        }
                    }
                }
            }
        }

        info!("Drain scheduler stopped");
    }
}

/// One drain: re-queue timed out messages, drop expired ones, then send.
pub async fn drain(sender: &UpstreamSender) -> Result<bool, Error> {
    let post_office = sender.post_office();
    post_office.check_in_flight_message_timeouts().await?;
    post_office.check_message_expirations().await?;
    sender.collect_and_send_parcels().await
}

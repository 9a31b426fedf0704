//! Drives collected parcels through the available couriers.

use std::{sync::Arc, time::Duration};

use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::{
    config::Config,
    courier::{Courier, CourierLounge},
    error::Error,
    parcel::StampedParcel,
    post_office::PostOffice,
};

/// Outcome of one attempt to send a parcel with one courier.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum SendResult {
    Success,
    TooBig,
    /// The courier did not answer in time. Its outcome is still reported to
    /// the post office once it arrives.
    Pending,
    Fail { cause: String },
}

impl SendResult {
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail { .. })
    }
}

#[derive(Clone)]
pub struct UpstreamSender {
    post_office: PostOffice,
    lounge: CourierLounge,
    courier_timeout: Duration,
}

impl UpstreamSender {
    pub fn new(post_office: PostOffice, lounge: CourierLounge, config: &Config) -> Self {
        Self {
            post_office,
            lounge,
            courier_timeout: config.courier_timeout(),
        }
    }

    pub fn post_office(&self) -> &PostOffice {
        &self.post_office
    }

    /// Sends every parcel the post office has ready.
    ///
    /// Each parcel is offered to the outbound couriers in registration order
    /// until one of them does not fail.
    ///
    /// # Returns
    ///
    /// `Ok(false)` if a parcel could not be delivered for a reason worth
    /// retrying soon, or if nothing was sent while no message is in flight
    /// either. `Ok(true)` otherwise.
    ///
    /// # Errors
    ///
    /// [`Error::PostOfficeClosed`] once the post office task has stopped.
    pub async fn collect_and_send_parcels(&self) -> Result<bool, Error> {
        let parcels = self.post_office.collect_parcels_for_sending().await?;

        if parcels.is_empty() {
            let in_flight = self.post_office.are_messages_in_flight().await?;
            if in_flight {
                trace!("Drain ran but no messages are available, waiting for in-flight messages");
            } else {
                debug!("Drain ran for apparently no reason");
            }
            return Ok(!in_flight);
        }

        let mut all_sent = true;
        for parcel in parcels {
            all_sent &= self.send_parcel(parcel).await?;
        }

        Ok(all_sent)
    }

    async fn send_parcel(&self, parcel: StampedParcel) -> Result<bool, Error> {
        let json = parcel.to_json();
        debug!(
            parcel_id = parcel.parcel_id(),
            size = json.len(),
            parcel = %json,
            "Sending parcel"
        );

        if parcel.messages().is_empty() {
            warn!("Attempting to send empty parcel, ignoring parcel");
            return Ok(true);
        }

        let couriers = self.lounge.outbound_couriers();
        if couriers.is_empty() {
            warn!(parcel_id = parcel.parcel_id(), "No courier available to send parcel");
        }

        let mut results = Vec::with_capacity(couriers.len());
        for courier in couriers {
            let result = self.attempt(&parcel, &courier).await?;
            log_attempt(&parcel, courier.id(), &result);

            let done = !result.is_fail();
            results.push(result);
            if done {
                break;
            }
        }

        if !results.is_empty() && results.iter().all(SendResult::is_fail) {
            error!(
                parcel_id = parcel.parcel_id(),
                "Could not send parcel with any of the available couriers"
            );
        }

        Ok(results.iter().any(|r| *r == SendResult::Success)
            || results.iter().all(|r| *r == SendResult::TooBig))
    }

    async fn attempt(
        &self,
        parcel: &StampedParcel,
        courier: &Arc<dyn Courier>,
    ) -> Result<SendResult, Error> {
        self.post_office.on_parcel_in_flight(parcel, courier.id())?;

        let delivery = courier.send_parcel(parcel.clone());
        let post_office = self.post_office.clone();
        let parcel_id = parcel.parcel_id().to_owned();
        let courier_id = courier.id().to_owned();
        let (tx, rx) = oneshot::channel();

        // The courier keeps running past the timeout so that a late ack or
        // error still reaches the post office.
        tokio::spawn(async move {
            let outcome = delivery.await;

            let result = match &outcome {
                Ok(()) => SendResult::Success,
                Err(e) if e.is_too_big() => SendResult::TooBig,
                Err(e) => SendResult::Fail {
                    cause: e.to_string(),
                },
            };

            let reported = match outcome {
                Ok(()) => post_office.on_parcel_ack(&parcel_id, &courier_id),
                Err(e) => post_office.on_parcel_error(&parcel_id, &courier_id, e),
            };
            if let Err(err) = reported {
                warn!(%parcel_id, courier = %courier_id, ?err, "Could not report parcel outcome");
            }

            let _ = tx.send(result);
        });

        match tokio::time::timeout(self.courier_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(SendResult::Fail {
                cause: "courier task stopped before reporting".to_owned(),
            }),
            Err(_) => Ok(SendResult::Pending),
        }
    }
}

fn log_attempt(parcel: &StampedParcel, courier_id: &str, result: &SendResult) {
    match result {
        SendResult::Fail { cause } => warn!(
            courier = courier_id,
            parcel_id = parcel.parcel_id(),
            %cause,
            "Parcel sending attempt failed"
        ),
        _ => trace!(
            courier = courier_id,
            parcel_id = parcel.parcel_id(),
            %result,
            "Parcel sending attempted"
        ),
    }
}

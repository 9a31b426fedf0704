//! Couriers are the transport channels parcels are delivered through.
//!
//! This module provides the [`Courier`] trait implemented by transports and the
//! [`CourierLounge`] which keeps track of the registered couriers in priority order.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
};

use snafu::Snafu;

use crate::parcel::StampedParcel;

/// Failure reported by a courier for a single parcel.
#[derive(Debug, Snafu)]
pub enum CourierError {
    /// The transport refused the parcel because of its size. The post office
    /// reacts by splitting the parcel.
    #[snafu(display("Parcel is too big: {message}"))]
    TooBig { message: String },

    #[snafu(display("Parcel sending failed: {message}"))]
    Transport {
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl CourierError {
    pub fn too_big(message: impl Into<String>) -> Self {
        Self::TooBig {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn is_too_big(&self) -> bool {
        matches!(self, Self::TooBig { .. })
    }
}

impl From<eyre::Report> for CourierError {
    fn from(e: eyre::Report) -> Self {
        Self::Transport {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

/// A transport channel able to deliver parcels to the server.
///
/// Implementations decide on any internal retries themselves; the returned
/// future resolves once the transport has either acknowledged the parcel or
/// given up on it.
pub trait Courier: Send + Sync + 'static {
    /// Stable identifier, used to key per-courier send attempts.
    fn id(&self) -> &str;

    /// Whether the courier can currently be used (e.g. its transport has been
    /// initialized).
    fn is_available(&self) -> bool {
        true
    }

    fn send_parcel(
        &self,
        parcel: StampedParcel,
    ) -> Pin<Box<dyn Future<Output = Result<(), CourierError>> + Send + 'static>>;
}

/// Registry of couriers, kept in the order they were registered which is also
/// the order they are tried in.
#[derive(Clone, Default)]
pub struct CourierLounge {
    couriers: Arc<RwLock<Vec<Arc<dyn Courier>>>>,
}

impl CourierLounge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_couriers(couriers: impl IntoIterator<Item = Arc<dyn Courier>>) -> Self {
        let lounge = Self::new();
        for courier in couriers {
            lounge.register(courier);
        }
        lounge
    }

    /// Adds a courier after all already registered ones. A courier with an id
    /// which is already registered replaces the existing one in place.
    pub fn register(&self, courier: Arc<dyn Courier>) {
        let mut couriers = self.couriers.write().unwrap_or_else(|e| e.into_inner());
        match couriers.iter_mut().find(|c| c.id() == courier.id()) {
            Some(existing) => *existing = courier,
            None => couriers.push(courier),
        }
    }

    pub fn unregister(&self, courier_id: &str) {
        self.couriers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|c| c.id() != courier_id);
    }

    /// Couriers which are currently available, in priority order.
    pub fn outbound_couriers(&self) -> Vec<Arc<dyn Courier>> {
        self.couriers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.is_available())
            .cloned()
            .collect()
    }
}

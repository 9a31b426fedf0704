//! Envelope metadata attached to parcels before they are handed to couriers.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::{Map, Value};

use crate::{
    message::types,
    parcel::{Parcel, StampedParcel},
};

const PLATFORM: i64 = 1;

/// Identity of the device and application the buffer runs in.
#[derive(Debug, Clone, Default, bon::Builder)]
#[builder(on(String, into))]
pub struct ClientIdentity {
    pub instance_id: String,
    pub device_id: String,
    pub app_id: String,
    pub package_name: String,
    #[builder(default = env!("CARGO_PKG_VERSION").to_owned())]
    pub sdk_version: String,
    /// Transport token, only sent at the parcel root for registration parcels
    pub token: Option<String>,
}

/// Identifiers set by the host application for the current user.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub custom_id: String,
    pub email: String,
    pub phone_number: String,
}

/// Shared handle to the user credentials, updated by the host application.
#[derive(Debug, Clone, Default)]
pub struct UserCredentials(Arc<RwLock<Credentials>>);

impl UserCredentials {
    pub fn set(&self, credentials: Credentials) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = credentials;
    }

    pub fn get(&self) -> Credentials {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[derive(Debug, Clone)]
pub struct ParcelStamper {
    identity: ClientIdentity,
    credentials: UserCredentials,
}

impl ParcelStamper {
    pub fn new(identity: ClientIdentity, credentials: UserCredentials) -> Self {
        Self {
            identity,
            credentials,
        }
    }

    pub fn stamp_parcel(&self, parcel: Parcel) -> StampedParcel {
        let mut stamp = self.create_stamp(&parcel);
        self.add_registration_token(&parcel, &mut stamp);
        StampedParcel::new(parcel, stamp)
    }

    fn create_stamp(&self, parcel: &Parcel) -> Map<String, Value> {
        let credentials = self.credentials.get();
        let identity = &self.identity;

        let mut stamp = Map::new();
        stamp.insert("platform".into(), PLATFORM.into());
        stamp.insert("message_id".into(), parcel.parcel_id().into());
        stamp.insert("instance_id".into(), identity.instance_id.clone().into());
        stamp.insert("device_id".into(), identity.device_id.clone().into());
        stamp.insert("app_id".into(), identity.app_id.clone().into());
        stamp.insert("package_name".into(), identity.package_name.clone().into());
        stamp.insert("sdk_version".into(), identity.sdk_version.clone().into());

        for (key, value) in [
            ("cid", credentials.custom_id),
            ("email", credentials.email),
            ("pn", credentials.phone_number),
        ] {
            if !value.trim().is_empty() {
                stamp.insert(key.into(), value.into());
            }
        }

        stamp.insert("time".into(), Utc::now().timestamp_millis().into());
        stamp
    }

    // The registration endpoint still reads the token from the parcel root.
    fn add_registration_token(&self, parcel: &Parcel, stamp: &mut Map<String, Value>) {
        let has_registration = parcel
            .messages()
            .iter()
            .any(|m| m.message_type == types::REGISTRATION);

        if has_registration {
            let token = self.identity.token.clone().unwrap_or_default();
            stamp.insert("token".into(), token.into());
        }
    }
}

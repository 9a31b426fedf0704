use std::sync::Arc;

use config::Config;
use courier::CourierLounge;
use persistence::{sqlite::SqlitePersistence, Persistence};
use post_office::PostOffice;
use registration::RegistrationGate;
use scheduler::DrainScheduler;
use sender::UpstreamSender;
use stamp::{ClientIdentity, ParcelStamper, UserCredentials};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod courier;
pub mod error;
pub mod inbound;
pub mod message;
pub mod parcel;
pub mod persistence;
pub mod post_office;
pub mod registration;
pub mod scheduler;
pub mod sender;
pub mod stamp;
pub mod store;
pub mod utils;

/// Installs the global tracing subscriber, filtered by `PARCELPOST_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("PARCELPOST_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("PARCELPOST_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}

/// A running post office together with the drain loop feeding its couriers.
pub struct Runtime {
    post_office: PostOffice,
    couriers: CourierLounge,
    cancel: CancellationToken,
    drains: JoinHandle<()>,
}

impl Runtime {
    pub fn post_office(&self) -> &PostOffice {
        &self.post_office
    }

    pub fn couriers(&self) -> &CourierLounge {
        &self.couriers
    }

    /// Stops the drain loop, then writes pending store changes.
    ///
    /// Outcomes reported by a drain which was running when the loop stopped
    /// are included in the final write.
    pub async fn shutdown(self) -> eyre::Result<()> {
        self.cancel.cancel();
        self.drains.await?;
        self.post_office.flush_persistence().await?;
        Ok(())
    }
}

/// Returns a builder for the post office runtime.
///
/// Without an explicit configuration it is loaded from the environment, and
/// without an explicit persistence messages are kept in the SQLite database at
/// the configured path.
#[bon::builder(finish_fn = start)]
pub async fn run(
    identity: ClientIdentity,
    #[builder(default)] credentials: UserCredentials,
    #[builder(default)] couriers: CourierLounge,
    #[builder(default)] registration: RegistrationGate,
    config: Option<Config>,
    persistence: Option<Arc<dyn Persistence>>,
) -> eyre::Result<Runtime> {
    if let Err(err) = init_tracing() {
        debug!(%err, "Tracing subscriber was already installed");
    }

    let config = Arc::new(match config {
        Some(config) => config,
        None => Config::load()?,
    });

    let persistence = match persistence {
        Some(persistence) => persistence,
        None => Arc::new(SqlitePersistence::connect(config.db_path()).await?),
    };

    let (scheduler, requests) = DrainScheduler::channel();

    let post_office = PostOffice::spawn()
        .config(config.clone())
        .persistence(persistence)
        .stamper(ParcelStamper::new(identity, credentials))
        .scheduler(Arc::new(scheduler))
        .registration(registration)
        .start();

    let sender = UpstreamSender::new(post_office.clone(), couriers.clone(), &config);
    let cancel = CancellationToken::new();
    let drains = tokio::spawn(requests.run(sender, config, cancel.clone()));

    Ok(Runtime {
        post_office,
        couriers,
        cancel,
        drains,
    })
}

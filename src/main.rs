use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use clap::{Parser, Subcommand};
use parcelpost::{
    config::Config,
    courier::{Courier, CourierError, CourierLounge},
    message::MessageState,
    parcel::StampedParcel,
    persistence::{sqlite::SqlitePersistence, Persistence, ReadOnly},
    post_office::PostOffice,
    registration::RegistrationGate,
    scheduler::{self, DrainScheduler},
    sender::UpstreamSender,
    stamp::{ClientIdentity, ParcelStamper, UserCredentials},
    store::MessageStore,
};
use tracing::info;

#[derive(Parser)]
#[clap(author, version, about)]
struct Args {
    /// Application id stamped on drained parcels
    #[clap(long, global = true, default_value = "parcelpost-cli")]
    app_id: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the pending messages by type and state
    Status,
    /// Send the pending messages once through a courier which logs every parcel
    Drain {
        /// Only print the parcels which would be sent, leaving the store untouched
        #[clap(long)]
        dry_run: bool,
    },
}

/// Courier which acknowledges every parcel after logging its wire form.
struct LoggingCourier;

impl Courier for LoggingCourier {
    fn id(&self) -> &str {
        "log"
    }

    fn send_parcel(
        &self,
        parcel: StampedParcel,
    ) -> Pin<Box<dyn Future<Output = Result<(), CourierError>> + Send + 'static>> {
        Box::pin(async move {
            info!(parcel_id = parcel.parcel_id(), parcel = %parcel.to_json(), "Delivered parcel");
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    parcelpost::init_tracing()?;

    let args = Args::parse();
    let config = Arc::new(Config::load()?);
    let persistence = Arc::new(SqlitePersistence::connect(config.db_path()).await?);

    match args.command {
        Commands::Status => status(config, persistence).await,
        Commands::Drain { dry_run } => drain(config, persistence, &args.app_id, dry_run).await,
    }
}

async fn status(config: Arc<Config>, persistence: Arc<SqlitePersistence>) -> eyre::Result<()> {
    let mut store = MessageStore::new(config, persistence);
    store.restore_messages().await;

    let mut summary = BTreeMap::<(i32, &'static str), usize>::new();
    for message in store.read_messages() {
        let state = match message.state() {
            MessageState::Created => "created",
            MessageState::Stored { .. } => "stored",
            MessageState::InFlight { .. } => "in-flight",
            MessageState::Sent { .. } => "sent",
        };
        *summary.entry((message.message_type(), state)).or_default() += 1;
    }

    println!("{} pending message(s)", store.len());
    for ((message_type, state), count) in summary {
        println!("  type {message_type:>4}  {state:<9}  {count}");
    }

    Ok(())
}

async fn drain(
    config: Arc<Config>,
    persistence: Arc<SqlitePersistence>,
    app_id: &str,
    dry_run: bool,
) -> eyre::Result<()> {
    let identity = ClientIdentity::builder()
        .instance_id(app_id)
        .device_id(app_id)
        .app_id(app_id)
        .package_name(app_id)
        .build();

    // Drains are started by hand, so the requests queued by the post office
    // are never acted upon.
    let (drain_scheduler, _requests) = DrainScheduler::channel();

    // A dry run must not clean up corrupt records found while restoring.
    let persistence: Arc<dyn Persistence> = if dry_run {
        Arc::new(ReadOnly::new(persistence))
    } else {
        persistence
    };

    let post_office = PostOffice::spawn()
        .config(config.clone())
        .persistence(persistence)
        .stamper(ParcelStamper::new(identity, UserCredentials::default()))
        .scheduler(Arc::new(drain_scheduler))
        .registration(RegistrationGate::completed())
        .start();

    if dry_run {
        let parcels = post_office.collect_parcels_for_sending().await?;
        for parcel in &parcels {
            println!("{}", parcel.to_json());
        }
        println!("{} parcel(s) ready", parcels.len());
        return Ok(());
    }

    let couriers = CourierLounge::with_couriers([Arc::new(LoggingCourier) as Arc<dyn Courier>]);
    let sender = UpstreamSender::new(post_office.clone(), couriers, &config);

    let sent = scheduler::drain(&sender).await?;
    post_office.flush_persistence().await?;

    info!(sent, remaining = post_office.read_messages().await?.len(), "Drain finished");

    Ok(())
}

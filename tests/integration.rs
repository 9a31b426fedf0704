use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use parcelpost::{
    config::Config,
    courier::{Courier, CourierError, CourierLounge},
    error::Error,
    inbound::DownstreamParcel,
    message::{Message, SendOptions, SendPriority, StoredMessage},
    parcel::StampedParcel,
    persistence::{memory::InMemoryPersistence, sqlite::SqlitePersistence, Persistence},
    post_office::PostOffice,
    registration::RegistrationGate,
    scheduler::{DrainScheduler, TaskScheduler},
    sender::UpstreamSender,
    stamp::{ClientIdentity, ParcelStamper, UserCredentials},
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{sync::broadcast::error::TryRecvError, time::sleep};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingScheduler {
    requests: Mutex<Vec<Option<Duration>>>,
}

impl RecordingScheduler {
    fn requests(&self) -> Vec<Option<Duration>> {
        self.requests.lock().unwrap().clone()
    }
}

impl TaskScheduler for RecordingScheduler {
    fn schedule_drain(&self, delay: Option<Duration>) {
        self.requests.lock().unwrap().push(delay);
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Ack,
    Fail,
    TooBig,
    Hang,
    AckAfter(Duration),
}

struct MockCourier {
    id: &'static str,
    behavior: Behavior,
    sent: Mutex<Vec<StampedParcel>>,
}

impl MockCourier {
    fn new(id: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id,
            behavior,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Courier for MockCourier {
    fn id(&self) -> &str {
        self.id
    }

    fn send_parcel(
        &self,
        parcel: StampedParcel,
    ) -> Pin<Box<dyn Future<Output = Result<(), CourierError>> + Send + 'static>> {
        self.sent.lock().unwrap().push(parcel);
        match self.behavior {
            Behavior::Ack => Box::pin(async { Ok(()) }),
            Behavior::Fail => Box::pin(async { Err(CourierError::transport("unreachable")) }),
            Behavior::TooBig => Box::pin(async { Err(CourierError::too_big("413")) }),
            Behavior::Hang => Box::pin(std::future::pending()),
            Behavior::AckAfter(delay) => Box::pin(async move {
                sleep(delay).await;
                Ok(())
            }),
        }
    }
}

struct Harness {
    post_office: PostOffice,
    scheduler: Arc<RecordingScheduler>,
    persistence: InMemoryPersistence,
}

impl Harness {
    /// Waits until every command sent so far has been handled.
    async fn settle(&self) -> Vec<StoredMessage> {
        self.post_office.read_messages().await.unwrap()
    }
}

fn identity() -> ClientIdentity {
    ClientIdentity::builder()
        .instance_id("instance")
        .device_id("device")
        .app_id("app")
        .package_name("com.example.app")
        .token("fcm-token".to_owned())
        .build()
}

fn spawn(
    config: Config,
    persistence: Arc<dyn Persistence>,
    scheduler: Arc<dyn TaskScheduler>,
    registration: RegistrationGate,
) -> PostOffice {
    PostOffice::spawn()
        .config(config)
        .persistence(persistence)
        .stamper(ParcelStamper::new(identity(), UserCredentials::default()))
        .scheduler(scheduler)
        .registration(registration)
        .start()
}

fn setup_with(config: Config, registration: RegistrationGate) -> Harness {
    let persistence = InMemoryPersistence::new();
    let scheduler = Arc::new(RecordingScheduler::default());

    Harness {
        post_office: spawn(
            config,
            Arc::new(persistence.clone()),
            scheduler.clone(),
            registration,
        ),
        scheduler,
        persistence,
    }
}

fn setup() -> Harness {
    setup_with(Config::default(), RegistrationGate::completed())
}

fn message(ty: i32, id: &str) -> Message {
    Message::with_id(ty, id, Map::new())
}

/// A message whose wire form is exactly `size` bytes long.
fn sized(ty: i32, id: &str, size: usize) -> Message {
    // {"pad":"...","time":<13 digits>}
    let mut payload = Map::new();
    payload.insert("pad".to_owned(), Value::from("x".repeat(size - 31)));
    let message = Message::with_id(ty, id, payload);
    assert_eq!(message.size(), size);
    message
}

fn whenever() -> SendOptions {
    SendOptions::with_priority(SendPriority::Whenever)
}

fn ids(parcel: &StampedParcel) -> Vec<&str> {
    parcel.parcel().message_ids().collect()
}

#[tokio::test(start_paused = true)]
async fn test_soon_messages_are_debounced() {
    let h = setup();

    for i in 0..3 {
        h.post_office
            .send_message(message(5, &format!("m{i}")), SendOptions::default());
        sleep(Duration::from_millis(500)).await;
    }

    sleep(Duration::from_millis(1400)).await;
    h.settle().await;
    assert!(h.scheduler.requests().is_empty());

    sleep(Duration::from_millis(200)).await;
    h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_and_late_priorities() {
    let h = setup();

    h.post_office.send_message(
        message(5, "late"),
        SendOptions::with_priority(SendPriority::Late),
    );
    h.post_office.send_message(
        message(5, "now"),
        SendOptions::with_priority(SendPriority::Immediate),
    );
    h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None]);

    sleep(Duration::from_secs(179)).await;
    h.settle().await;
    assert_eq!(h.scheduler.requests().len(), 1);

    sleep(Duration::from_secs(2)).await;
    h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None, None]);
}

#[tokio::test(start_paused = true)]
async fn test_buffer_waits_for_full_parcel() {
    let h = setup_with(
        Config {
            max_parcel_size: Some(200),
            ..Default::default()
        },
        RegistrationGate::completed(),
    );

    h.post_office.send_message(sized(1, "w1", 120), whenever());
    h.post_office.send_message(sized(1, "w2", 120), whenever());
    sleep(Duration::from_secs(1)).await;
    h.settle().await;
    assert!(h.scheduler.requests().is_empty());

    h.post_office.send_message(
        message(1, "b1"),
        SendOptions::with_priority(SendPriority::Buffer),
    );
    sleep(Duration::from_millis(600)).await;
    h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn test_registration_gates_sending() {
    let registration = RegistrationGate::new();
    let h = setup_with(Config::default(), registration.clone());

    h.post_office
        .send_message(message(5, "gated"), SendOptions::default());
    sleep(Duration::from_secs(3)).await;
    h.settle().await;
    assert!(h.scheduler.requests().is_empty());
    assert!(h
        .post_office
        .collect_parcels_for_sending()
        .await
        .unwrap()
        .is_empty());

    h.post_office.send_message(
        message(10, "register"),
        SendOptions::builder()
            .priority(SendPriority::Immediate)
            .requires_registration(false)
            .persist(false)
            .build(),
    );
    h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None]);

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    assert_eq!(parcels.len(), 1);
    assert_eq!(ids(&parcels[0]), vec!["register"]);
    assert_eq!(parcels[0].stamp()["token"], Value::from("fcm-token"));

    registration.complete();
    sleep(Duration::from_millis(10)).await;
    h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None, None]);

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    assert_eq!(parcels.len(), 1);
    assert_eq!(ids(&parcels[0]), vec!["gated", "register"]);
}

#[tokio::test(start_paused = true)]
async fn test_acked_message_is_removed() {
    let h = setup();

    h.post_office
        .send_message(sized(5, "m1", 100), SendOptions::default());
    sleep(Duration::from_secs(2)).await;
    let stored = h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None]);
    assert_eq!(stored[0].message_size(), 100);

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    assert_eq!(parcels.len(), 1);
    assert_eq!(ids(&parcels[0]), vec!["m1"]);

    h.post_office.on_parcel_in_flight(&parcels[0], "fcm").unwrap();
    let stored = h.settle().await;
    assert_eq!(
        stored[0].state().in_flight_parcel(),
        Some(parcels[0].parcel_id())
    );

    h.post_office
        .on_parcel_ack(parcels[0].parcel_id(), "fcm")
        .unwrap();
    assert!(h.settle().await.is_empty());

    h.post_office.flush_persistence().await.unwrap();
    assert!(h.persistence.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_parcels_respect_groups_and_size() {
    let h = setup();

    h.post_office.send_message(
        sized(5, "big1", 2000),
        SendOptions::builder().parcel_group_key("g1").build(),
    );
    h.post_office.send_message(
        sized(5, "big2", 2000),
        SendOptions::builder().parcel_group_key("g1").build(),
    );
    h.post_office.send_message(
        message(5, "x1"),
        SendOptions::builder().parcel_group_key("x").build(),
    );
    h.post_office.send_message(
        message(5, "y1"),
        SendOptions::builder().parcel_group_key("y").build(),
    );
    h.post_office.send_message(message(5, "none"), SendOptions::default());
    h.post_office.send_message(
        message(5, "x2"),
        SendOptions::builder().parcel_group_key("x").build(),
    );

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    let mut contents = parcels.iter().map(ids).collect::<Vec<_>>();
    contents.sort();

    assert_eq!(
        contents,
        vec![
            vec!["big1"],
            vec!["big2"],
            vec!["none"],
            vec!["x1", "x2"],
            vec!["y1"],
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_too_big_parcel_is_split() {
    let h = setup();

    for i in 0..10 {
        h.post_office
            .send_message(message(5, &format!("m{i}")), whenever());
    }

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    assert_eq!(parcels.len(), 1);
    assert_eq!(parcels[0].messages().len(), 10);

    let parcel_id = parcels[0].parcel_id();
    h.post_office.on_parcel_in_flight(&parcels[0], "fcm").unwrap();
    h.post_office
        .on_parcel_error(parcel_id, "fcm", CourierError::too_big("413"))
        .unwrap();

    let stored = h.settle().await;
    assert_eq!(stored.len(), 10);

    let mut sub_groups = HashMap::<String, usize>::new();
    for message in &stored {
        assert!(message.state().is_stored());
        let key = message.state().parcel_sub_group_key().unwrap().to_owned();
        *sub_groups.entry(key).or_default() += 1;
    }
    assert_eq!(sub_groups.len(), 2);
    assert!(sub_groups.values().all(|count| *count == 5));

    assert!(h.scheduler.requests().is_empty());
    sleep(Duration::from_millis(1100)).await;
    h.settle().await;
    assert_eq!(h.scheduler.requests(), vec![None]);

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    assert_eq!(parcels.len(), 2);
    assert!(parcels.iter().all(|p| p.messages().len() == 5));
}

#[tokio::test(start_paused = true)]
async fn test_too_big_single_message_is_dropped() {
    let h = setup();
    h.post_office.send_message(message(5, "huge"), whenever());

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    h.post_office.on_parcel_in_flight(&parcels[0], "fcm").unwrap();
    h.post_office
        .on_parcel_error(parcels[0].parcel_id(), "fcm", CourierError::too_big("413"))
        .unwrap();

    assert!(h.settle().await.is_empty());

    sleep(Duration::from_secs(5)).await;
    h.settle().await;
    assert!(h.scheduler.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_parcels_back_off() {
    let h = setup();
    h.post_office.send_message(
        message(5, "a"),
        SendOptions::builder()
            .priority(SendPriority::Whenever)
            .parcel_group_key("a")
            .build(),
    );

    for expected in [8, 16] {
        let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
        h.post_office.on_parcel_in_flight(&parcels[0], "fcm").unwrap();
        h.post_office
            .on_parcel_error(parcels[0].parcel_id(), "fcm", CourierError::transport("503"))
            .unwrap();
        sleep(Duration::from_millis(1100)).await;
        h.settle().await;

        assert_eq!(
            h.scheduler.requests().last(),
            Some(&Some(Duration::from_secs(expected)))
        );
    }

    let stored = h.settle().await;
    assert!(stored[0].state().is_stored());
    assert_eq!(stored[0].attempts_with("fcm"), 2);

    // Failures within the coalescing window produce a single retry using the
    // shortest backoff.
    h.post_office.send_message(
        message(5, "b"),
        SendOptions::builder()
            .priority(SendPriority::Whenever)
            .parcel_group_key("b")
            .build(),
    );
    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    assert_eq!(parcels.len(), 2);
    for parcel in &parcels {
        h.post_office.on_parcel_in_flight(parcel, "fcm").unwrap();
        h.post_office
            .on_parcel_error(parcel.parcel_id(), "fcm", CourierError::transport("503"))
            .unwrap();
    }
    sleep(Duration::from_millis(1100)).await;
    h.settle().await;

    assert_eq!(
        h.scheduler.requests(),
        vec![
            Some(Duration::from_secs(8)),
            Some(Duration::from_secs(16)),
            Some(Duration::from_secs(8)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_timeout_requeues_message() {
    let h = setup_with(
        Config {
            message_timeout_ms: Some(0),
            ..Default::default()
        },
        RegistrationGate::completed(),
    );
    h.post_office.send_message(message(5, "m1"), whenever());

    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    h.post_office.on_parcel_in_flight(&parcels[0], "http").unwrap();

    assert_eq!(
        h.post_office
            .check_in_flight_message_timeouts()
            .await
            .unwrap(),
        1
    );

    let stored = h.settle().await;
    assert!(stored[0].state().is_stored());
    assert_eq!(stored[0].attempts_with("http"), 1);
    assert_eq!(
        h.post_office
            .check_in_flight_message_timeouts()
            .await
            .unwrap(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_expired_messages_are_disposed() {
    let h = setup();
    let now = Utc::now();

    h.post_office
        .send_message(message(5, "flying").at(now - TimeDelta::days(8)), whenever());
    let parcels = h.post_office.collect_parcels_for_sending().await.unwrap();
    h.post_office.on_parcel_in_flight(&parcels[0], "fcm").unwrap();

    h.post_office
        .send_message(message(5, "old").at(now - TimeDelta::days(8)), whenever());
    h.post_office.send_message(
        message(5, "short").at(now - TimeDelta::hours(2)),
        SendOptions::builder()
            .priority(SendPriority::Whenever)
            .expire_after(Duration::from_secs(3600))
            .build(),
    );
    h.post_office.send_message(
        message(5, "fresh"),
        SendOptions::builder()
            .priority(SendPriority::Whenever)
            .expire_after(Duration::from_secs(3600))
            .build(),
    );

    assert_eq!(h.post_office.check_message_expirations().await.unwrap(), 2);

    let remaining = h
        .settle()
        .await
        .iter()
        .map(|m| m.message_id().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(remaining, vec!["flying", "fresh"]);
}

#[tokio::test(start_paused = true)]
async fn test_store_limits_and_unregistered_persistence() {
    let h = setup_with(
        Config {
            max_pending_per_type: HashMap::from([(7, 3)]),
            ..Default::default()
        },
        RegistrationGate::completed(),
    );

    for i in 0..4 {
        h.post_office
            .send_message(message(7, &format!("m{i}")), whenever());
    }
    h.post_office.send_message(message(8, "m0"), whenever());
    h.post_office.send_message(
        message(9, "volatile"),
        SendOptions::builder()
            .priority(SendPriority::Whenever)
            .requires_registration(false)
            .build(),
    );

    let stored = h.settle().await;
    let ids = stored.iter().map(StoredMessage::message_id).collect::<Vec<_>>();
    assert_eq!(ids, vec!["m0", "m1", "m2", "volatile"]);
    assert!(!stored[3].is_persisted());

    h.post_office.flush_persistence().await.unwrap();
    assert_eq!(h.persistence.len(), 3);
    assert!(h.persistence.get("volatile").is_none());
}

#[tokio::test]
async fn test_messages_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parcelpost.db").to_string_lossy().to_string();

    let before = {
        let persistence = Arc::new(SqlitePersistence::connect(&path).await.unwrap());
        let scheduler = Arc::new(RecordingScheduler::default());
        let post_office = spawn(
            Config::default(),
            persistence,
            scheduler,
            RegistrationGate::completed(),
        );

        let mut payload = Map::new();
        payload.insert("screen".to_owned(), Value::from("home"));
        post_office.send_message(
            Message::with_id(21, "a", payload),
            SendOptions::builder()
                .priority(SendPriority::Late)
                .parcel_group_key("g1")
                .build(),
        );
        post_office.send_message(
            message(5, "b"),
            SendOptions::with_priority(SendPriority::Immediate),
        );

        for parcel in post_office.collect_parcels_for_sending().await.unwrap() {
            post_office.on_parcel_in_flight(&parcel, "fcm").unwrap();
            post_office
                .on_parcel_error(parcel.parcel_id(), "fcm", CourierError::transport("503"))
                .unwrap();
        }

        let before = post_office.read_messages().await.unwrap();
        post_office.flush_persistence().await.unwrap();
        before
    };

    let persistence = Arc::new(SqlitePersistence::connect(&path).await.unwrap());
    let scheduler = Arc::new(RecordingScheduler::default());
    let post_office = spawn(
        Config::default(),
        persistence,
        scheduler.clone(),
        RegistrationGate::completed(),
    );

    let mut after = post_office.read_messages().await.unwrap();
    after.sort_by(|a, b| a.message_id().cmp(b.message_id()));
    assert_eq!(after.len(), before.len());

    for restored in &after {
        let original = before
            .iter()
            .find(|m| m.message_id() == restored.message_id())
            .unwrap();
        assert_eq!(restored.message_type(), original.message_type());
        assert_eq!(restored.send_priority(), original.send_priority());
        assert_eq!(restored.send_attempts(), original.send_attempts());
        assert_eq!(restored.message().payload, original.message().payload);
        assert_eq!(restored.parcel_group_key(), original.parcel_group_key());
        assert_eq!(restored.attempts_with("fcm"), 1);
    }

    // The restored `Immediate` message triggers a drain right away.
    assert_eq!(scheduler.requests(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn test_sender_falls_through_failing_courier() {
    let h = setup();
    let fcm = MockCourier::new("fcm", Behavior::Fail);
    let http = MockCourier::new("http", Behavior::Ack);
    let lounge = CourierLounge::with_couriers([
        fcm.clone() as Arc<dyn Courier>,
        http.clone() as Arc<dyn Courier>,
    ]);
    let sender = UpstreamSender::new(h.post_office.clone(), lounge, &Config::default());

    h.post_office.send_message(message(5, "m1"), whenever());

    assert!(sender.collect_and_send_parcels().await.unwrap());
    assert_eq!(fcm.sent_count(), 1);
    assert_eq!(http.sent_count(), 1);
    assert!(h.settle().await.is_empty());

    // Nothing left to send and nothing in flight.
    assert!(sender.collect_and_send_parcels().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_sender_stops_at_pending_courier() {
    let h = setup();
    let slow = MockCourier::new("slow", Behavior::Hang);
    let backup = MockCourier::new("backup", Behavior::Ack);
    let lounge = CourierLounge::with_couriers([
        slow.clone() as Arc<dyn Courier>,
        backup.clone() as Arc<dyn Courier>,
    ]);
    let sender = UpstreamSender::new(h.post_office.clone(), lounge, &Config::default());

    h.post_office.send_message(message(5, "m1"), whenever());

    assert!(!sender.collect_and_send_parcels().await.unwrap());
    assert_eq!(slow.sent_count(), 1);
    assert_eq!(backup.sent_count(), 0);

    assert!(h.post_office.are_messages_in_flight().await.unwrap());
    assert!(!sender.collect_and_send_parcels().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_sender_treats_too_big_as_handled() {
    let h = setup();
    let fcm = MockCourier::new("fcm", Behavior::TooBig);
    let lounge = CourierLounge::with_couriers([fcm.clone() as Arc<dyn Courier>]);
    let sender = UpstreamSender::new(h.post_office.clone(), lounge, &Config::default());

    h.post_office.send_message(message(5, "a"), whenever());
    h.post_office.send_message(message(5, "b"), whenever());

    assert!(sender.collect_and_send_parcels().await.unwrap());

    let stored = h.settle().await;
    assert_eq!(stored.len(), 2);
    assert_ne!(
        stored[0].state().parcel_sub_group_key(),
        stored[1].state().parcel_sub_group_key()
    );
}

#[tokio::test(start_paused = true)]
async fn test_drain_scheduler_delivers_messages() {
    let config = Arc::new(Config {
        flush_interval_ms: Some(60_000),
        ..Default::default()
    });
    let courier = MockCourier::new("fcm", Behavior::Ack);
    let lounge = CourierLounge::with_couriers([courier.clone() as Arc<dyn Courier>]);

    let (scheduler, requests) = DrainScheduler::channel();
    let post_office = spawn(
        (*config).clone(),
        Arc::new(InMemoryPersistence::new()),
        Arc::new(scheduler),
        RegistrationGate::completed(),
    );
    let sender = UpstreamSender::new(post_office.clone(), lounge, &config);
    let cancel = CancellationToken::new();
    let drains = tokio::spawn(requests.run(sender, config.clone(), cancel.clone()));

    post_office.send_message(message(5, "soon"), SendOptions::default());
    sleep(Duration::from_secs(3)).await;
    assert_eq!(courier.sent_count(), 1);
    assert!(post_office.read_messages().await.unwrap().is_empty());

    // `Whenever` messages only leave with the periodic flush.
    post_office.send_message(message(5, "whenever"), whenever());
    sleep(Duration::from_secs(30)).await;
    assert_eq!(courier.sent_count(), 1);

    sleep(Duration::from_secs(31)).await;
    assert_eq!(courier.sent_count(), 2);
    assert!(post_office.read_messages().await.unwrap().is_empty());

    cancel.cancel();
    drains.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_persists_outcomes_of_running_drain() {
    let persistence = InMemoryPersistence::new();
    let courier = MockCourier::new("fcm", Behavior::AckAfter(Duration::from_secs(1)));

    let runtime = parcelpost::run()
        .identity(identity())
        .couriers(CourierLounge::with_couriers([courier.clone() as Arc<dyn Courier>]))
        .registration(RegistrationGate::completed())
        .config(Config::default())
        .persistence(Arc::new(persistence.clone()))
        .start()
        .await
        .unwrap();

    runtime.post_office().send_message(
        message(5, "m1"),
        SendOptions::with_priority(SendPriority::Immediate),
    );
    sleep(Duration::from_millis(10)).await;
    assert_eq!(courier.sent_count(), 1);

    runtime.shutdown().await.unwrap();
    assert!(persistence.is_empty());
}

#[derive(Debug, Deserialize)]
struct Greeting {
    text: String,
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_local_parcels_reach_subscribers() {
    let h = setup();
    let mut raw = h.post_office.receive_messages();

    let greetings = Arc::new(Mutex::new(Vec::new()));
    let _handler = h.post_office.mailbox().mail_box_parsed::<Greeting, _>(30, {
        let greetings = greetings.clone();
        move |greeting| {
            greetings.lock().unwrap().push(greeting.text.clone());
            if greeting.text == "fail" {
                eyre::bail!("handler failed");
            }
            Ok(())
        }
    });

    h.post_office
        .handle_local_parcel(
            object(json!({
                "t30": [{ "text": "hello" }, { "text": "fail" }, { "text": "again" }],
                "t31": { "x": 1 },
            })),
            Some("local-1"),
        )
        .unwrap();

    let mut types = Vec::new();
    for _ in 0..4 {
        let received = raw.recv().await.unwrap();
        assert_eq!(received.message_id, "local-1");
        assert_eq!(received.data["message_id"], Value::from("local-1"));
        types.push(received.message_type);
    }
    assert_eq!(types, vec![30, 30, 30, 31]);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(*greetings.lock().unwrap(), vec!["hello", "fail", "again"]);

    // An id carried by the parcel wins over the default one.
    h.post_office
        .handle_local_parcel(object(json!({ "message_id": "own", "t30": {} })), Some("unused"))
        .unwrap();
    assert_eq!(raw.recv().await.unwrap().message_id, "own");

    h.post_office
        .handle_local_parcel(object(json!({ "t31": {} })), None)
        .unwrap();
    assert_eq!(raw.recv().await.unwrap().message_id.len(), 15);

    let invalid = h
        .post_office
        .handle_local_parcel(object(json!({ "message_id": 7, "t30": {} })), None);
    assert!(matches!(invalid, Err(Error::ParcelParse { .. })));
    assert!(matches!(raw.try_recv(), Err(TryRecvError::Empty)));

    h.post_office.on_inbound_parcel_received(
        DownstreamParcel::from_json(r#"{ "message_id": "remote", "t30": { "text": "from server" } }"#)
            .unwrap(),
    );
    assert_eq!(raw.recv().await.unwrap().message_id, "remote");

    sleep(Duration::from_millis(10)).await;
    assert_eq!(
        greetings.lock().unwrap().last().map(String::as_str),
        Some("from server")
    );
}

//! In-process pipeline test: inbound device messages all the way through
//! registration, routing and transforms to the viewer update stream, over
//! fakes of the cloud surfaces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use nimbus_domain::{
    AccountInfo, CellLocationResolver, CloudApi, CloudLink, CloudLinkFactory, DeviceListing,
    DeviceRecord, DeviceRegistry, DeviceStore, DomainResult, HistoricalMessage, InboundMessage,
    IssuedCertificates, LinkEvent, MessagePage, MessageRouter, UiPublisher,
};
use nimbus_ui::UiBroadcaster;

struct FakeCloudApi;

#[async_trait]
impl CloudApi for FakeCloudApi {
    async fn issue_certificates(
        &self,
        _device_id: &str,
        _ownership_code: &str,
    ) -> DomainResult<IssuedCertificates> {
        Ok(IssuedCertificates {
            ca_cert: "ca".to_string(),
            client_cert: "cert".to_string(),
            private_key: "key".to_string(),
        })
    }

    async fn associate_device(&self, _device_id: &str, _ownership_code: &str) -> DomainResult<()> {
        Ok(())
    }

    async fn describe_account(&self) -> DomainResult<AccountInfo> {
        Ok(AccountInfo {
            mqtt_endpoint: "mqtt.example.com".to_string(),
            messages_prefix: "prod/acct-1/m/".to_string(),
        })
    }

    async fn list_devices(&self) -> DomainResult<Vec<DeviceListing>> {
        Ok(Vec::new())
    }

    async fn fetch_device_state(&self, _device_id: &str) -> DomainResult<Value> {
        Ok(json!({}))
    }

    async fn fetch_messages(
        &self,
        _device_id: &str,
        _start: DateTime<Utc>,
        _page_token: Option<String>,
    ) -> DomainResult<MessagePage> {
        Ok(MessagePage {
            items: Vec::<HistoricalMessage>::new(),
            next_start_key: None,
        })
    }
}

#[derive(Default)]
struct RecordingLink {
    published: Mutex<Vec<(String, String)>>,
    shadow_patches: Mutex<Vec<Value>>,
}

#[async_trait]
impl CloudLink for RecordingLink {
    async fn publish(&self, topic: &str, payload: &str) -> DomainResult<()> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, _topic: &str) -> DomainResult<()> {
        Ok(())
    }

    async fn update_shadow(&self, patch: &Value) -> DomainResult<()> {
        self.shadow_patches.lock().await.push(patch.clone());
        Ok(())
    }
}

struct RecordingLinkFactory {
    link: Arc<RecordingLink>,
    // Keeps link event channels open for the test's lifetime.
    event_senders: Mutex<Vec<mpsc::Sender<LinkEvent>>>,
}

#[async_trait]
impl CloudLinkFactory for RecordingLinkFactory {
    async fn open(
        &self,
        _record: &DeviceRecord,
        _mqtt_endpoint: &str,
    ) -> DomainResult<(Arc<dyn CloudLink>, mpsc::Receiver<LinkEvent>)> {
        let (tx, rx) = mpsc::channel(4);
        self.event_senders.lock().await.push(tx);
        Ok((Arc::clone(&self.link) as Arc<dyn CloudLink>, rx))
    }
}

#[derive(Default)]
struct InMemoryStore {
    records: Mutex<Vec<DeviceRecord>>,
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn load(&self) -> DomainResult<Vec<DeviceRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn persist(&self, record: &DeviceRecord) -> DomainResult<()> {
        let mut records = self.records.lock().await;
        records.retain(|existing| existing.short_id != record.short_id);
        records.push(record.clone());
        Ok(())
    }
}

struct Pipeline {
    router: Arc<MessageRouter>,
    broadcaster: Arc<UiBroadcaster>,
    link: Arc<RecordingLink>,
    store: Arc<InMemoryStore>,
}

async fn pipeline() -> Pipeline {
    let link = Arc::new(RecordingLink::default());
    let store = Arc::new(InMemoryStore::default());
    let factory = Arc::new(RecordingLinkFactory {
        link: Arc::clone(&link),
        event_senders: Mutex::new(Vec::new()),
    });
    let cloud = Arc::new(FakeCloudApi);
    let account = cloud.describe_account().await.unwrap();

    let registry = DeviceRegistry::new(Arc::clone(&store) as _, cloud, factory, account);
    registry.bootstrap(0).await.unwrap();

    let broadcaster = UiBroadcaster::new();
    let router = MessageRouter::new(
        registry,
        Arc::new(CellLocationResolver::new(Vec::new())),
        Arc::clone(&broadcaster) as Arc<dyn UiPublisher>,
    );

    Pipeline {
        router,
        broadcaster,
        link,
        store,
    }
}

fn app_message(app_id: &str, data: &str) -> InboundMessage {
    InboundMessage::parse(json!({
        "appId": app_id,
        "messageType": "DATA",
        "data": data,
    }))
    .unwrap()
}

async fn next_frame(viewer: &mut tokio::sync::broadcast::Receiver<String>) -> Value {
    let frame = timeout(Duration::from_secs(5), viewer.recv())
        .await
        .expect("timed out waiting for a viewer update")
        .expect("viewer channel closed");
    serde_json::from_str(&frame).unwrap()
}

#[tokio::test]
async fn telemetry_from_an_unknown_device_reaches_viewers_and_the_cloud() {
    let pipeline = pipeline().await;
    let mut viewer = pipeline.broadcaster.subscribe();

    pipeline
        .router
        .dispatch("device-7", app_message("AIR_PRESS", "98.5"))
        .await;

    let frame = next_frame(&mut viewer).await;
    assert_eq!(frame["update"]["pressure"], 985.0);

    // The unknown short id was registered on demand and persisted.
    let records = pipeline.store.records.lock().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].short_id, "device-7");

    // The raw message was republished on the device's d2c channel.
    let published = pipeline.link.published.lock().await;
    assert_eq!(published.len(), 1);
    let (topic, payload) = &published[0];
    assert!(topic.starts_with("prod/acct-1/m/d/"));
    assert!(topic.ends_with("/d2c"));
    assert!(payload.contains("98.5"));
}

#[tokio::test]
async fn messages_for_one_device_are_applied_in_arrival_order() {
    let pipeline = pipeline().await;
    let mut viewer = pipeline.broadcaster.subscribe();

    for value in ["1.0", "2.0", "3.0"] {
        pipeline.router.dispatch("0", app_message("TEMP", value)).await;
    }

    for expected in [1.0, 2.0, 3.0] {
        let frame = next_frame(&mut viewer).await;
        assert_eq!(frame["update"]["temperature"], expected);
    }
}

#[tokio::test]
async fn manual_override_produces_fix_and_synthesized_gps_message() {
    let pipeline = pipeline().await;
    let mut viewer = pipeline.broadcaster.subscribe();

    let message = InboundMessage::parse(json!({"geo": ["63.42", "10.43"]})).unwrap();
    pipeline.router.dispatch("0", message).await;

    let frame = next_frame(&mut viewer).await;
    assert_eq!(frame["geolocation"]["lat"], 63.42);
    assert_eq!(frame["geolocation"]["lng"], 10.43);

    let published = pipeline.link.published.lock().await;
    assert_eq!(published.len(), 1);
    assert!(published[0].1.contains("$GPGGA"));

    let states = pipeline.broadcaster.device_states().await;
    let state = states.values().next().unwrap();
    assert_eq!(state.fix.unwrap().lat, 63.42);
}

#[tokio::test]
async fn sentinel_rsrp_never_leaves_the_gateway() {
    let pipeline = pipeline().await;
    let mut viewer = pipeline.broadcaster.subscribe();

    pipeline.router.dispatch("0", app_message("RSRP", "5")).await;
    // A following valid reading proves the worker processed the sentinel.
    pipeline.router.dispatch("0", app_message("RSRP", "-80")).await;

    let frame = next_frame(&mut viewer).await;
    assert_eq!(frame["update"]["rsrp"], -80.0);

    let published = pipeline.link.published.lock().await;
    assert_eq!(published.len(), 1);
    assert!(published[0].1.contains("-80"));
}

#[tokio::test]
async fn shadow_updates_are_forwarded_to_the_cloud() {
    let pipeline = pipeline().await;

    let shadow = json!({"state": {"reported": {"batteryVoltage": 3.7}}});
    pipeline
        .router
        .dispatch("0", InboundMessage::parse(shadow.clone()).unwrap())
        .await;

    // The shadow path has no viewer frame to wait on; poll the recorder.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if pipeline.link.shadow_patches.lock().await.last() == Some(&shadow) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "shadow update never reached the cloud link"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

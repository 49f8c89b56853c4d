use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use nimbus_domain::{CellGeolocation, DeviceReading, GeoFix, UiPublisher};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Last-seen transformed telemetry per device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReadings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsrp: Option<f64>,
}

impl DeviceReadings {
    fn apply(&mut self, reading: DeviceReading) {
        match reading {
            DeviceReading::Temperature(v) => self.temperature = Some(v),
            DeviceReading::Humidity(v) => self.humidity = Some(v),
            DeviceReading::Pressure(v) => self.pressure = Some(v),
            DeviceReading::AirQuality(v) => self.air_quality = Some(v),
            DeviceReading::SignalStrength(v) => self.rsrp = Some(v),
        }
    }
}

/// Everything the UI knows about one device, rebuilt from live traffic and
/// startup backfill. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct DeviceUiState {
    pub fix: Option<GeoFix>,
    pub cell_location: Option<CellGeolocation>,
    pub readings: DeviceReadings,
    pub imei: Option<String>,
    pub network_info: Option<Value>,
}

/// Fans incremental updates out to every connected viewer and keeps the
/// live per-device state the snapshot endpoint serves.
///
/// Delivery uses a broadcast channel: a slow or disconnected viewer lags or
/// drops on its own subscription and never affects the others.
pub struct UiBroadcaster {
    updates: broadcast::Sender<String>,
    state: RwLock<HashMap<String, DeviceUiState>>,
}

impl UiBroadcaster {
    pub fn new() -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            updates,
            state: RwLock::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    pub async fn device_states(&self) -> HashMap<String, DeviceUiState> {
        self.state.read().await.clone()
    }

    fn send(&self, frame: Value) {
        let frame = frame.to_string();
        debug!(viewers = self.updates.receiver_count(), frame = %frame, "ui update");
        // No receivers is not an error; updates are best-effort.
        let _ = self.updates.send(frame);
    }
}

#[async_trait]
impl UiPublisher for UiBroadcaster {
    async fn publish_fix(&self, device_id: &str, fix: GeoFix) {
        self.state
            .write()
            .await
            .entry(device_id.to_string())
            .or_default()
            .fix = Some(fix);
        self.send(json!({ "deviceId": device_id, "geolocation": fix }));
    }

    async fn publish_cell_location(&self, device_id: &str, location: CellGeolocation) {
        self.state
            .write()
            .await
            .entry(device_id.to_string())
            .or_default()
            .cell_location = Some(location);
        self.send(json!({ "deviceId": device_id, "cellGeolocation": location }));
    }

    async fn publish_reading(&self, device_id: &str, reading: DeviceReading) {
        self.state
            .write()
            .await
            .entry(device_id.to_string())
            .or_default()
            .readings
            .apply(reading);
        self.send(json!({
            "deviceId": device_id,
            "update": { (reading.field()): reading.value() }
        }));
    }

    async fn publish_network_info(&self, device_id: &str, network_info: Value) {
        self.state
            .write()
            .await
            .entry(device_id.to_string())
            .or_default()
            .network_info = Some(network_info.clone());
        self.send(json!({ "deviceId": device_id, "networkInfo": network_info }));
    }

    async fn publish_imei(&self, device_id: &str, imei: &str) {
        self.state
            .write()
            .await
            .entry(device_id.to_string())
            .or_default()
            .imei = Some(imei.to_string());
        self.send(json!({ "deviceId": device_id, "imei": imei }));
    }
}

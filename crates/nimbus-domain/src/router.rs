use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::registry::{DeviceConnection, DeviceRegistry};
use crate::resolver::CellLocationResolver;
use crate::traits::UiPublisher;
use crate::types::{AppTransform, CellQuery, DeviceReading, GeoFix, InboundMessage, APP_GPS};
use nimbus_nmea::Sentence;

/// Whether a handled message is republished to the cloud link. Backfill
/// replays history for the UI only and skips the cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Republish {
    Forward,
    Skip,
}

/// Classifies inbound device messages and drives the cloud link, the cell
/// geolocation resolver, the GPS decoder and the UI fan-out.
///
/// One worker task per short id applies messages strictly in arrival order,
/// so shadow updates and publishes for a device cannot reorder; different
/// devices proceed in parallel.
pub struct MessageRouter {
    registry: Arc<DeviceRegistry>,
    resolver: Arc<CellLocationResolver>,
    ui: Arc<dyn UiPublisher>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        resolver: Arc<CellLocationResolver>,
        ui: Arc<dyn UiPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            resolver,
            ui,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Hand one inbound message to the device's worker, creating the worker
    /// (and, for unknown short ids, the device itself) on first contact.
    /// Does not wait for any downstream work.
    pub async fn dispatch(self: &Arc<Self>, short_id: &str, message: InboundMessage) {
        let mut message = message;
        loop {
            let sender = {
                let mut workers = self.workers.lock().await;
                match workers.get(short_id) {
                    Some(sender) => sender.clone(),
                    None => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        workers.insert(short_id.to_string(), tx.clone());
                        tokio::spawn(Arc::clone(self).run_device_worker(
                            short_id.to_string(),
                            tx.clone(),
                            rx,
                        ));
                        tx
                    }
                }
            };
            match sender.send(message) {
                Ok(()) => return,
                // The worker shut down after a failed connect; retire its
                // sender and start a fresh one.
                Err(mpsc::error::SendError(returned)) => {
                    self.workers.lock().await.remove(short_id);
                    message = returned;
                }
            }
        }
    }

    async fn run_device_worker(
        self: Arc<Self>,
        short_id: String,
        own_sender: mpsc::UnboundedSender<InboundMessage>,
        mut messages: mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        let connection = match self.registry.connect(&short_id).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(
                    short_id = %short_id,
                    error = %e,
                    "device connect failed, dropping queued messages"
                );
                // Retire only this worker's own queue; a replacement may
                // already be registered.
                let mut workers = self.workers.lock().await;
                if workers
                    .get(&short_id)
                    .is_some_and(|sender| sender.same_channel(&own_sender))
                {
                    workers.remove(&short_id);
                }
                return;
            }
        };
        while let Some(message) = messages.recv().await {
            self.handle(&connection, message, Republish::Forward).await;
        }
    }

    /// Apply one message for a resolved device connection.
    pub async fn handle(
        self: &Arc<Self>,
        connection: &DeviceConnection,
        message: InboundMessage,
        republish: Republish,
    ) {
        match message {
            InboundMessage::ShadowUpdate(shadow) => {
                self.handle_shadow(connection, shadow, republish).await;
            }
            InboundMessage::ManualLocation { lat, lng } => {
                self.handle_manual_location(connection, lat, lng, republish)
                    .await;
            }
            InboundMessage::App { app_id, data, raw } => {
                self.handle_app(connection, &app_id, &data, &raw, republish)
                    .await;
            }
        }
    }

    async fn handle_shadow(
        self: &Arc<Self>,
        connection: &DeviceConnection,
        shadow: Value,
        republish: Republish,
    ) {
        if republish == Republish::Forward {
            if let Err(e) = connection.update_shadow(&shadow).await {
                error!(
                    short_id = %connection.short_id,
                    error = %e,
                    "failed to update shadow"
                );
            }
        }

        // Enrichment runs decoupled from the per-device queue; a slow
        // geolocation provider must not hold up later messages.
        let router = Arc::clone(self);
        let device_id = connection.device_id.clone();
        tokio::spawn(async move {
            router.enrich_shadow(&device_id, &shadow).await;
        });
    }

    /// Derive cell geolocation and device metadata from a shadow document
    /// and forward them to the UI. Failures are logged only.
    pub async fn enrich_shadow(&self, device_id: &str, shadow: &Value) {
        let Some(device) = shadow.pointer("/state/reported/device") else {
            return;
        };

        if let Some(network_info) = device.get("networkInfo") {
            self.ui
                .publish_network_info(device_id, network_info.clone())
                .await;
            match serde_json::from_value::<CellQuery>(network_info.clone()) {
                Ok(query) => match self.resolver.resolve(&query).await {
                    Ok(location) => {
                        self.ui.publish_cell_location(device_id, location).await;
                    }
                    Err(e) => {
                        warn!(
                            device_id = %device_id,
                            cell = %query,
                            error = %e,
                            "cell geolocation enrichment failed"
                        );
                    }
                },
                Err(e) => {
                    debug!(
                        device_id = %device_id,
                        error = %e,
                        "network info block lacks cell identifiers"
                    );
                }
            }
        }

        if let Some(imei) = device
            .pointer("/deviceInfo/imei")
            .and_then(Value::as_str)
        {
            self.ui.publish_imei(device_id, imei).await;
        }
    }

    /// An operator placed the device on the map by hand. Broadcast the fix
    /// and publish an equivalent GPS message so cloud consumers observe a
    /// consistent event.
    async fn handle_manual_location(
        &self,
        connection: &DeviceConnection,
        lat: f64,
        lng: f64,
        republish: Republish,
    ) {
        let fix = GeoFix {
            lat,
            lng,
            fix_timestamp: Utc::now(),
        };
        info!(
            short_id = %connection.short_id,
            lat = lat,
            lng = lng,
            "manual location override"
        );
        self.ui.publish_fix(&connection.device_id, fix).await;

        if republish == Republish::Forward {
            let sentence = nimbus_nmea::gga_sentence(lat, lng, fix.fix_timestamp.time());
            if let Err(e) = connection.send_app_message(APP_GPS, &sentence).await {
                error!(
                    short_id = %connection.short_id,
                    error = %e,
                    "failed to publish synthesized GPS message"
                );
            }
        }
    }

    async fn handle_app(
        &self,
        connection: &DeviceConnection,
        app_id: &str,
        data: &str,
        raw: &Value,
        republish: Republish,
    ) {
        if app_id == APP_GPS {
            self.handle_gps(connection, data).await;
        } else {
            match DeviceReading::classify(app_id, data) {
                Ok(AppTransform::Tracked(reading)) => {
                    self.ui.publish_reading(&connection.device_id, reading).await;
                }
                Ok(AppTransform::Untracked) => {}
                Ok(AppTransform::Filtered) => {
                    debug!(
                        short_id = %connection.short_id,
                        app_id = %app_id,
                        data = %data,
                        "sentinel reading filtered"
                    );
                    return;
                }
                Err(e) => {
                    // The transform failed but the raw message still goes
                    // to the cloud below.
                    warn!(
                        short_id = %connection.short_id,
                        app_id = %app_id,
                        error = %e,
                        "failed to transform reading"
                    );
                }
            }
        }

        if republish == Republish::Forward {
            if let Err(e) = connection.publish(&raw.to_string()).await {
                error!(
                    short_id = %connection.short_id,
                    app_id = %app_id,
                    error = %e,
                    "failed to publish to cloud link"
                );
            }
        }
    }

    async fn handle_gps(&self, connection: &DeviceConnection, data: &str) {
        match nimbus_nmea::parse_sentence(data) {
            Ok(Sentence::Gga(gga)) => {
                let Some((lat, lng)) = gga.position() else {
                    debug!(short_id = %connection.short_id, "GGA sentence without usable fix");
                    return;
                };
                let fix_timestamp = gga
                    .time
                    .map(|time| Utc::now().date_naive().and_time(time).and_utc())
                    .unwrap_or_else(Utc::now);
                let fix = GeoFix {
                    lat,
                    lng,
                    fix_timestamp,
                };
                self.ui.publish_fix(&connection.device_id, fix).await;
            }
            Ok(_) => {
                debug!(short_id = %connection.short_id, "ignoring non-fix NMEA sentence");
            }
            Err(e) => {
                warn!(
                    short_id = %connection.short_id,
                    error = %e,
                    "failed to decode GPS payload"
                );
            }
        }
    }
}

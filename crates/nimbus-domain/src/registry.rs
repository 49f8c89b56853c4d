use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{DomainError, DomainResult};
use crate::traits::{AccountInfo, CloudApi, CloudLink, CloudLinkFactory, DeviceStore, LinkEvent};
use crate::types::{DeviceRecord, APP_DEVICE};

/// Service catalog advertised to the cloud UI on every connect.
const UI_SERVICES: [&str; 9] = [
    "GPS",
    "FLIP",
    "GEN",
    "TEMP",
    "HUMID",
    "AIR_PRESS",
    "RSRP",
    "BUTTON",
    "DEVICE",
];

/// Runtime handle for one device, bound 1:1 to its record. Owns the cloud
/// link session; exactly one exists per short id at any time.
pub struct DeviceConnection {
    pub short_id: String,
    pub device_id: String,
    messages_prefix: String,
    link: Arc<dyn CloudLink>,
}

impl DeviceConnection {
    pub(crate) fn new(
        record: &DeviceRecord,
        messages_prefix: &str,
        link: Arc<dyn CloudLink>,
    ) -> Self {
        Self {
            short_id: record.short_id.clone(),
            device_id: record.device_id.clone(),
            messages_prefix: messages_prefix.to_string(),
            link,
        }
    }

    fn d2c_topic(&self) -> String {
        format!("{}d/{}/d2c", self.messages_prefix, self.device_id)
    }

    /// Publish a raw payload on the device's own d2c channel.
    pub async fn publish(&self, payload: &str) -> DomainResult<()> {
        let topic = self.d2c_topic();
        debug!(short_id = %self.short_id, topic = %topic, payload = %payload, "publishing");
        self.link.publish(&topic, payload).await
    }

    /// Publish a structured application message on the d2c channel.
    pub async fn send_app_message(&self, app_id: &str, data: &str) -> DomainResult<()> {
        let message = json!({
            "appId": app_id,
            "messageType": "DATA",
            "data": data,
        });
        self.publish(&message.to_string()).await
    }

    pub async fn update_shadow(&self, patch: &Value) -> DomainResult<()> {
        self.link.update_shadow(patch).await
    }
}

type ConnectOutcome = Result<Arc<DeviceConnection>, Arc<DomainError>>;
type PendingConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

/// Owns the device collection: persisted records, live connections, and
/// on-demand registration of short ids never seen before.
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    cloud: Arc<dyn CloudApi>,
    link_factory: Arc<dyn CloudLinkFactory>,
    account: AccountInfo,
    records: Mutex<HashMap<String, DeviceRecord>>,
    connections: Mutex<HashMap<String, Arc<DeviceConnection>>>,
    // In-flight connect attempts, shared so concurrent callers for the same
    // short id rendezvous on a single outcome.
    pending: Mutex<HashMap<String, PendingConnect>>,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        cloud: Arc<dyn CloudApi>,
        link_factory: Arc<dyn CloudLinkFactory>,
        account: AccountInfo,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cloud,
            link_factory,
            account,
            records: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Load persisted records and provision new identities until the target
    /// count is reached. Short ids are assigned sequentially.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self, target_device_count: usize) -> DomainResult<()> {
        let loaded = self.store.load().await?;
        {
            let mut records = self.records.lock().await;
            for record in loaded {
                records.insert(record.short_id.clone(), record);
            }
            info!(count = records.len(), "loaded device records");
        }

        loop {
            let short_id = {
                let records = self.records.lock().await;
                if records.len() >= target_device_count {
                    break;
                }
                next_free_short_id(&records)
            };
            let record = self.provision(&short_id).await?;
            info!(
                short_id = %record.short_id,
                device_id = %record.device_id,
                "new device created"
            );
        }
        Ok(())
    }

    /// Mint a fresh identity, obtain its certificates and persist the
    /// record. Nothing is persisted when issuance fails.
    async fn provision(&self, short_id: &str) -> DomainResult<DeviceRecord> {
        let device_id = xid::new().to_string();
        let ownership_code = xid::new().to_string();
        let certificates = self
            .cloud
            .issue_certificates(&device_id, &ownership_code)
            .await
            .map_err(|e| DomainError::Provisioning {
                device_id: device_id.clone(),
                reason: e.to_string(),
            })?;
        let record = DeviceRecord {
            short_id: short_id.to_string(),
            device_id,
            ownership_code,
            ca_cert: certificates.ca_cert,
            private_key: certificates.private_key,
            client_cert: certificates.client_cert,
            associated: false,
        };
        self.store.persist(&record).await?;
        self.records
            .lock()
            .await
            .insert(record.short_id.clone(), record.clone());
        Ok(record)
    }

    /// Connect every known record. Individual failures are logged and do
    /// not stop the remaining devices.
    pub async fn connect_all(self: &Arc<Self>) {
        let mut short_ids: Vec<String> = self.records.lock().await.keys().cloned().collect();
        short_ids.sort();
        for short_id in short_ids {
            if let Err(e) = self.connect(&short_id).await {
                error!(short_id = %short_id, error = %e, "failed to connect device");
            }
        }
    }

    /// Resolve the connection for a short id, creating it if needed.
    /// Idempotent; a short id without a record is registered on demand.
    /// Concurrent callers for the same short id await the same attempt, so
    /// at most one registration/connect is ever in flight per key.
    pub async fn connect(self: &Arc<Self>, short_id: &str) -> DomainResult<Arc<DeviceConnection>> {
        if let Some(existing) = self.connections.lock().await.get(short_id) {
            return Ok(Arc::clone(existing));
        }

        let attempt = {
            let mut pending = self.pending.lock().await;
            if let Some(inflight) = pending.get(short_id) {
                inflight.clone()
            } else {
                let registry = Arc::clone(self);
                let key = short_id.to_string();
                let attempt: PendingConnect = async move {
                    let outcome = registry.do_connect(&key).await.map_err(Arc::new);
                    registry.pending.lock().await.remove(&key);
                    outcome
                }
                .boxed()
                .shared();
                pending.insert(short_id.to_string(), attempt.clone());
                attempt
            }
        };

        attempt.await.map_err(|e| DomainError::Registration {
            short_id: short_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn do_connect(self: &Arc<Self>, short_id: &str) -> DomainResult<Arc<DeviceConnection>> {
        // A racing caller may have finished in the window between the fast
        // path and the pending-map insert.
        if let Some(existing) = self.connections.lock().await.get(short_id) {
            return Ok(Arc::clone(existing));
        }

        let record = self.records.lock().await.get(short_id).cloned();
        let record = match record {
            Some(record) => record,
            None => {
                info!(short_id = %short_id, "unknown short id, registering on demand");
                self.provision(short_id).await?
            }
        };

        let (link, events) = self
            .link_factory
            .open(&record, &self.account.mqtt_endpoint)
            .await?;
        let connection = Arc::new(DeviceConnection::new(
            &record,
            &self.account.messages_prefix,
            link,
        ));
        tokio::spawn(
            Arc::clone(self).run_link_events(Arc::clone(&connection), events),
        );
        self.connections
            .lock()
            .await
            .insert(short_id.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Consume lifecycle events for one device's link session.
    async fn run_link_events(
        self: Arc<Self>,
        connection: Arc<DeviceConnection>,
        mut events: mpsc::Receiver<LinkEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Connected => {
                    info!(
                        short_id = %connection.short_id,
                        device_id = %connection.device_id,
                        "device connected"
                    );
                    self.on_connected(&connection).await;
                }
                LinkEvent::Disconnected => {
                    warn!(short_id = %connection.short_id, "device disconnected");
                }
                LinkEvent::Reconnecting => {
                    debug!(short_id = %connection.short_id, "device reconnecting");
                }
                LinkEvent::Error(reason) => {
                    error!(short_id = %connection.short_id, error = %reason, "cloud link error");
                }
            }
        }
    }

    async fn on_connected(&self, connection: &Arc<DeviceConnection>) {
        let catalog = json!({
            "state": {
                "reported": {
                    "device": { "serviceInfo": { "ui": UI_SERVICES } }
                }
            }
        });
        if let Err(e) = connection.update_shadow(&catalog).await {
            warn!(
                short_id = %connection.short_id,
                error = %e,
                "failed to report service catalog"
            );
        }

        let needs_association = self
            .records
            .lock()
            .await
            .get(&connection.short_id)
            .map(|record| !record.associated)
            .unwrap_or(false);
        if !needs_association {
            return;
        }
        if let Err(e) = self.associate(connection).await {
            error!(
                short_id = %connection.short_id,
                error = %e,
                "association failed"
            );
        }
    }

    /// First-connect association: claim the device with its ownership code,
    /// flip and persist the flag, then greet on the device's own channel.
    async fn associate(&self, connection: &Arc<DeviceConnection>) -> DomainResult<()> {
        let ownership_code = self
            .records
            .lock()
            .await
            .get(&connection.short_id)
            .map(|record| record.ownership_code.clone())
            .ok_or_else(|| DomainError::Association {
                device_id: connection.device_id.clone(),
                reason: "record missing".to_string(),
            })?;

        self.cloud
            .associate_device(&connection.device_id, &ownership_code)
            .await?;

        // Flip and persist before greeting, so a crash after this point
        // cannot re-run association on the next connect.
        let updated = {
            let mut records = self.records.lock().await;
            let record =
                records
                    .get_mut(&connection.short_id)
                    .ok_or_else(|| DomainError::Association {
                        device_id: connection.device_id.clone(),
                        reason: "record missing".to_string(),
                    })?;
            record.associated = true;
            record.clone()
        };
        self.store.persist(&updated).await?;
        info!(device_id = %connection.device_id, "device associated with account");

        let greeting = format!(
            "Hello from the gateway! I am device {}.",
            connection.short_id
        );
        if let Err(e) = connection.send_app_message(APP_DEVICE, &greeting).await {
            warn!(
                short_id = %connection.short_id,
                error = %e,
                "failed to publish greeting"
            );
        }
        Ok(())
    }

    /// Snapshot of the live connections.
    pub async fn active_connections(&self) -> Vec<Arc<DeviceConnection>> {
        let mut connections: Vec<_> = self.connections.lock().await.values().cloned().collect();
        connections.sort_by(|a, b| a.short_id.cmp(&b.short_id));
        connections
    }
}

fn next_free_short_id(records: &HashMap<String, DeviceRecord>) -> String {
    let mut candidate = 0usize;
    loop {
        let short_id = candidate.to_string();
        if !records.contains_key(&short_id) {
            return short_id;
        }
        candidate += 1;
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::DomainResult;
use crate::types::{CellGeolocation, CellQuery, DeviceRecord, DeviceReading, GeoFix};

/// Certificate material returned by the provisioning endpoint.
#[derive(Debug, Clone)]
pub struct IssuedCertificates {
    pub ca_cert: String,
    pub client_cert: String,
    pub private_key: String,
}

/// The account's pub/sub connection parameters.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub mqtt_endpoint: String,
    pub messages_prefix: String,
}

/// One entry of the cloud device listing.
#[derive(Debug, Clone)]
pub struct DeviceListing {
    pub id: String,
    pub name: Option<String>,
}

/// One historical device-to-cloud application message.
#[derive(Debug, Clone)]
pub struct HistoricalMessage {
    pub app_id: String,
    pub data: String,
}

/// A page of historical messages plus the continuation token, if any.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub items: Vec<HistoricalMessage>,
    pub next_start_key: Option<String>,
}

/// The cloud platform's REST surface, as far as the gateway consumes it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Issue certificates for a new device identity. The ownership code is
    /// the secret later used for association.
    async fn issue_certificates(
        &self,
        device_id: &str,
        ownership_code: &str,
    ) -> DomainResult<IssuedCertificates>;

    /// Associate a connected device with the account.
    async fn associate_device(&self, device_id: &str, ownership_code: &str) -> DomainResult<()>;

    /// Fetch the account's pub/sub endpoint and topic prefix.
    async fn describe_account(&self) -> DomainResult<AccountInfo>;

    /// List registered devices with their display names.
    async fn list_devices(&self) -> DomainResult<Vec<DeviceListing>>;

    /// Fetch a device's last reported shadow document.
    async fn fetch_device_state(&self, device_id: &str) -> DomainResult<Value>;

    /// Fetch one page of historical messages for a device, newest first.
    async fn fetch_messages(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        page_token: Option<String>,
    ) -> DomainResult<MessagePage>;
}

/// Lifecycle events emitted by a cloud link session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Error(String),
}

/// An established pub/sub session for one device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> DomainResult<()>;

    async fn subscribe(&self, topic: &str) -> DomainResult<()>;

    /// Apply a patch to the device's shadow document.
    async fn update_shadow(&self, patch: &Value) -> DomainResult<()>;
}

/// Opens cloud link sessions from a device's certificate material.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudLinkFactory: Send + Sync {
    async fn open(
        &self,
        record: &DeviceRecord,
        mqtt_endpoint: &str,
    ) -> DomainResult<(Arc<dyn CloudLink>, mpsc::Receiver<LinkEvent>)>;
}

/// Persistence for the device collection, keyed by short id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Load all persisted records. A store that has never been written is
    /// empty, not an error.
    async fn load(&self) -> DomainResult<Vec<DeviceRecord>>;

    /// Persist one record, rewriting the backing document.
    async fn persist(&self, record: &DeviceRecord) -> DomainResult<()>;
}

/// One cell-geolocation backend in the fallback chain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CellLocationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn locate(&self, query: &CellQuery) -> DomainResult<CellGeolocation>;
}

/// Sink for live UI updates. The implementation owns the viewer fan-out and
/// the per-device snapshot state; these calls never fail upward.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UiPublisher: Send + Sync {
    async fn publish_fix(&self, device_id: &str, fix: GeoFix);

    async fn publish_cell_location(&self, device_id: &str, location: CellGeolocation);

    async fn publish_reading(&self, device_id: &str, reading: DeviceReading);

    async fn publish_network_info(&self, device_id: &str, network_info: Value);

    async fn publish_imei(&self, device_id: &str, imei: &str);
}

use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::DomainResult;
use crate::registry::DeviceConnection;
use crate::router::{MessageRouter, Republish};
use crate::traits::CloudApi;
use crate::types::InboundMessage;

/// App ids restored from history at startup.
pub const REPLAYED_APP_IDS: [&str; 6] = ["TEMP", "AIR_QUAL", "HUMID", "AIR_PRESS", "GPS", "RSRP"];

/// Rebuilds the UI's per-device state after a restart by replaying recent
/// history and the last reported shadow through the router's transform
/// path. Nothing is republished to the cloud.
pub struct HistoryReplayService {
    cloud: Arc<dyn CloudApi>,
    router: Arc<MessageRouter>,
    window_hours: i64,
}

impl HistoryReplayService {
    pub fn new(cloud: Arc<dyn CloudApi>, router: Arc<MessageRouter>, window_hours: i64) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            router,
            window_hours,
        })
    }

    /// Replay all given devices concurrently. A failing device never
    /// affects the others.
    pub async fn replay_all(self: &Arc<Self>, connections: Vec<Arc<DeviceConnection>>) {
        let mut tasks = JoinSet::new();
        for connection in connections {
            let service = Arc::clone(self);
            tasks.spawn(async move {
                service.replay_device(&connection).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn replay_device(&self, connection: &Arc<DeviceConnection>) {
        if let Err(e) = self.replay_messages(connection).await {
            warn!(
                device_id = %connection.device_id,
                error = %e,
                "history replay failed"
            );
        }
        if let Err(e) = self.replay_shadow(connection).await {
            warn!(
                device_id = %connection.device_id,
                error = %e,
                "shadow replay failed"
            );
        }
    }

    /// Page through the message history (newest first), keep the first
    /// value seen per recognized app id and replay those through the
    /// router without cloud republication.
    async fn replay_messages(&self, connection: &Arc<DeviceConnection>) -> DomainResult<()> {
        let start = Utc::now() - Duration::hours(self.window_hours);
        let mut latest: HashMap<String, String> = HashMap::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .cloud
                .fetch_messages(&connection.device_id, start, page_token.take())
                .await?;
            for item in page.items {
                if !REPLAYED_APP_IDS.contains(&item.app_id.as_str()) {
                    continue;
                }
                latest.entry(item.app_id).or_insert(item.data);
            }
            match page.next_start_key {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            device_id = %connection.device_id,
            readings = latest.len(),
            "replaying historical readings"
        );
        for (app_id, data) in latest {
            let raw = json!({
                "appId": app_id.clone(),
                "messageType": "DATA",
                "data": data.clone(),
            });
            let message = InboundMessage::App { app_id, data, raw };
            self.router
                .handle(connection, message, Republish::Skip)
                .await;
        }
        Ok(())
    }

    /// Fetch the device's last reported shadow once and run it through the
    /// same enrichment path as a live shadow update.
    async fn replay_shadow(&self, connection: &Arc<DeviceConnection>) -> DomainResult<()> {
        let state = self.cloud.fetch_device_state(&connection.device_id).await?;
        self.router
            .enrich_shadow(&connection.device_id, &state)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use crate::resolver::CellLocationResolver;
    use crate::traits::{
        AccountInfo, HistoricalMessage, MessagePage, MockCloudApi, MockCloudLink,
        MockCloudLinkFactory, MockDeviceStore, MockUiPublisher,
    };
    use crate::types::{DeviceReading, DeviceRecord};
    use crate::error::DomainError;

    fn test_connection() -> Arc<DeviceConnection> {
        let record = DeviceRecord {
            short_id: "0".to_string(),
            device_id: "dev-0".to_string(),
            ownership_code: "own-0".to_string(),
            ca_cert: "ca".to_string(),
            private_key: "key".to_string(),
            client_cert: "cert".to_string(),
            associated: true,
        };
        let mut link = MockCloudLink::new();
        // Backfill must never publish to the cloud.
        link.expect_publish().times(0);
        link.expect_update_shadow().times(0);
        Arc::new(DeviceConnection::new(
            &record,
            "prod/acct-1/m/",
            Arc::new(link),
        ))
    }

    fn router_with(ui: MockUiPublisher) -> Arc<MessageRouter> {
        let registry = DeviceRegistry::new(
            Arc::new(MockDeviceStore::new()),
            Arc::new(MockCloudApi::new()),
            Arc::new(MockCloudLinkFactory::new()),
            AccountInfo {
                mqtt_endpoint: "mqtt.example.com".to_string(),
                messages_prefix: "prod/acct-1/m/".to_string(),
            },
        );
        MessageRouter::new(
            registry,
            Arc::new(CellLocationResolver::new(Vec::new())),
            Arc::new(ui),
        )
    }

    fn message(app_id: &str, data: &str) -> HistoricalMessage {
        HistoricalMessage {
            app_id: app_id.to_string(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn keeps_first_value_per_app_id_across_pages() {
        let mut cloud = MockCloudApi::new();
        let mut seq = mockall::Sequence::new();
        cloud
            .expect_fetch_messages()
            .withf(|device_id: &str, _, token: &Option<String>| {
                device_id == "dev-0" && token.is_none()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(MessagePage {
                    items: vec![
                        message("TEMP", "24.5"),
                        message("BUTTON", "1"),
                        message("TEMP", "11.1"),
                    ],
                    next_start_key: Some("page-2".to_string()),
                })
            });
        cloud
            .expect_fetch_messages()
            .withf(|_, _, token: &Option<String>| token.as_deref() == Some("page-2"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(MessagePage {
                    items: vec![message("HUMID", "40"), message("TEMP", "9.0")],
                    next_start_key: None,
                })
            });
        cloud
            .expect_fetch_device_state()
            .times(1)
            .returning(|_| Ok(serde_json::json!({"id": "dev-0"})));

        let mut ui = MockUiPublisher::new();
        ui.expect_publish_reading()
            .withf(|_, reading: &DeviceReading| *reading == DeviceReading::Temperature(24.5))
            .times(1)
            .returning(|_, _| ());
        ui.expect_publish_reading()
            .withf(|_, reading: &DeviceReading| *reading == DeviceReading::Humidity(40.0))
            .times(1)
            .returning(|_, _| ());

        let service = HistoryReplayService::new(Arc::new(cloud), router_with(ui), 24);
        service.replay_all(vec![test_connection()]).await;
    }

    #[tokio::test]
    async fn failures_do_not_cross_devices() {
        let mut cloud = MockCloudApi::new();
        cloud
            .expect_fetch_messages()
            .withf(|device_id: &str, _, _| device_id == "dev-0")
            .returning(|_, _, _| Err(DomainError::CloudApi("history endpoint down".to_string())));
        cloud
            .expect_fetch_messages()
            .withf(|device_id: &str, _, _| device_id == "dev-1")
            .times(1)
            .returning(|_, _, _| {
                Ok(MessagePage {
                    items: vec![message("AIR_PRESS", "98.5")],
                    next_start_key: None,
                })
            });
        cloud
            .expect_fetch_device_state()
            .returning(|_| Err(DomainError::CloudApi("state endpoint down".to_string())));

        let mut ui = MockUiPublisher::new();
        ui.expect_publish_reading()
            .withf(|device_id: &str, reading: &DeviceReading| {
                device_id == "dev-1" && *reading == DeviceReading::Pressure(985.0)
            })
            .times(1)
            .returning(|_, _| ());

        let healthy = {
            let record = DeviceRecord {
                short_id: "1".to_string(),
                device_id: "dev-1".to_string(),
                ownership_code: "own-1".to_string(),
                ca_cert: "ca".to_string(),
                private_key: "key".to_string(),
                client_cert: "cert".to_string(),
                associated: true,
            };
            let mut link = MockCloudLink::new();
            link.expect_publish().times(0);
            Arc::new(DeviceConnection::new(
                &record,
                "prod/acct-1/m/",
                Arc::new(link),
            ))
        };

        let service = HistoryReplayService::new(Arc::new(cloud), router_with(ui), 24);
        service.replay_all(vec![test_connection(), healthy]).await;
    }
}

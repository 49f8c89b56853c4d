//! MQTT realization of the cloud link: one TLS session per device,
//! authenticated with the device's own certificate material.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use nimbus_domain::{
    CloudLink, CloudLinkFactory, DeviceRecord, DomainError, DomainResult, LinkEvent,
};

const MQTT_TLS_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct MqttLinkFactory;

impl MqttLinkFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MqttLinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudLinkFactory for MqttLinkFactory {
    async fn open(
        &self,
        record: &DeviceRecord,
        mqtt_endpoint: &str,
    ) -> DomainResult<(Arc<dyn CloudLink>, mpsc::Receiver<LinkEvent>)> {
        let mut options =
            MqttOptions::new(record.device_id.clone(), mqtt_endpoint, MQTT_TLS_PORT);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: record.ca_cert.clone().into_bytes(),
            alpn: None,
            client_auth: Some((
                record.client_cert.clone().into_bytes(),
                record.private_key.clone().into_bytes(),
            )),
        }));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (events_tx, events_rx) = mpsc::channel(16);

        let device_id = record.device_id.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if events_tx.send(LinkEvent::Connected).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        if events_tx.send(LinkEvent::Disconnected).await.is_err() {
                            break;
                        }
                    }
                    Ok(event) => {
                        debug!(device_id = %device_id, ?event, "mqtt event");
                    }
                    Err(e) => {
                        if events_tx
                            .send(LinkEvent::Error(e.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        let _ = events_tx.send(LinkEvent::Reconnecting).await;
                        // rumqttc reconnects on the next poll; pace it.
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        let link = MqttCloudLink {
            client,
            device_id: record.device_id.clone(),
        };
        Ok((Arc::new(link), events_rx))
    }
}

pub struct MqttCloudLink {
    client: AsyncClient,
    device_id: String,
}

fn shadow_update_topic(device_id: &str) -> String {
    format!("$aws/things/{}/shadow/update", device_id)
}

#[async_trait]
impl CloudLink for MqttCloudLink {
    async fn publish(&self, topic: &str, payload: &str) -> DomainResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| DomainError::Link(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> DomainResult<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| DomainError::Link(e.to_string()))
    }

    async fn update_shadow(&self, patch: &serde_json::Value) -> DomainResult<()> {
        let topic = shadow_update_topic(&self.device_id);
        self.publish(&topic, &patch.to_string()).await
    }
}

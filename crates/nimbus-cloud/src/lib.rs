//! Cloud platform integrations: the REST client, the MQTT-backed cloud
//! link, and the cell geolocation providers.

pub mod cellgeo;
pub mod mqtt;
pub mod rest;

pub use cellgeo::{RegionalLocationProvider, UnwiredProvider};
pub use mqtt::MqttLinkFactory;
pub use rest::CloudRestClient;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};

// Application ids used on the device-to-cloud channel.
pub const APP_GPS: &str = "GPS";
pub const APP_TEMPERATURE: &str = "TEMP";
pub const APP_AIR_QUALITY: &str = "AIR_QUAL";
pub const APP_HUMIDITY: &str = "HUMID";
pub const APP_PRESSURE: &str = "AIR_PRESS";
pub const APP_SIGNAL: &str = "RSRP";
pub const APP_DEVICE: &str = "DEVICE";

/// One provisioned device: wire address, cloud identity and credentials.
///
/// Created by provisioning or loaded from the store; the only field that
/// changes afterwards is `associated`, which flips to true exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub short_id: String,
    pub device_id: String,
    pub ownership_code: String,
    pub ca_cert: String,
    pub private_key: String,
    pub client_cert: String,
    #[serde(default)]
    pub associated: bool,
}

/// A cell tower identifier, used as a value-equality cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellQuery {
    pub mccmnc: u32,
    #[serde(rename = "areaCode")]
    pub area_code: u32,
    #[serde(rename = "cellID")]
    pub cell_id: u64,
}

impl std::fmt::Display for CellQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mccmnc={} area={} cell={}",
            self.mccmnc, self.area_code, self.cell_id
        )
    }
}

/// Approximate position derived from a cell tower lookup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellGeolocation {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    #[serde(rename = "ts")]
    pub resolved_at: DateTime<Utc>,
}

/// A GPS position fix. Replaces any earlier fix for the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoFix {
    pub lat: f64,
    pub lng: f64,
    pub fix_timestamp: DateTime<Utc>,
}

/// A transformed telemetry value tracked per device for the UI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceReading {
    Temperature(f64),
    Humidity(f64),
    Pressure(f64),
    AirQuality(f64),
    SignalStrength(f64),
}

/// Outcome of classifying an application message for UI tracking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppTransform {
    /// A recognized telemetry value, transformed for the UI.
    Tracked(DeviceReading),
    /// Not a tracked app id; forwarded to the cloud verbatim.
    Untracked,
    /// A sentinel value that must not be forwarded anywhere.
    Filtered,
}

impl DeviceReading {
    /// Classify an application message by app id, applying the numeric
    /// transforms. Air pressure arrives in kPa×10⁻¹ and is scaled to hPa;
    /// non-negative RSRP readings are modem sentinels and are filtered.
    pub fn classify(app_id: &str, data: &str) -> DomainResult<AppTransform> {
        let parse = || -> DomainResult<f64> {
            data.trim().parse().map_err(|_| {
                DomainError::InvalidMessage(format!(
                    "non-numeric {} value: {:?}",
                    app_id, data
                ))
            })
        };
        let transform = match app_id {
            APP_TEMPERATURE => AppTransform::Tracked(DeviceReading::Temperature(parse()?)),
            APP_HUMIDITY => AppTransform::Tracked(DeviceReading::Humidity(parse()?)),
            APP_AIR_QUALITY => AppTransform::Tracked(DeviceReading::AirQuality(parse()?)),
            APP_PRESSURE => AppTransform::Tracked(DeviceReading::Pressure(parse()? * 10.0)),
            APP_SIGNAL => {
                let value = parse()?;
                if value < 0.0 {
                    AppTransform::Tracked(DeviceReading::SignalStrength(value))
                } else {
                    AppTransform::Filtered
                }
            }
            _ => AppTransform::Untracked,
        };
        Ok(transform)
    }

    /// The field name the reading is reported under in UI updates.
    pub fn field(&self) -> &'static str {
        match self {
            DeviceReading::Temperature(_) => "temperature",
            DeviceReading::Humidity(_) => "humidity",
            DeviceReading::Pressure(_) => "pressure",
            DeviceReading::AirQuality(_) => "airQuality",
            DeviceReading::SignalStrength(_) => "rsrp",
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            DeviceReading::Temperature(v)
            | DeviceReading::Humidity(v)
            | DeviceReading::Pressure(v)
            | DeviceReading::AirQuality(v)
            | DeviceReading::SignalStrength(v) => *v,
        }
    }
}

/// An inbound device message, discriminated at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Contains a `state` key; forwarded verbatim as a shadow update.
    ShadowUpdate(Value),
    /// `{geo: [lat, lng]}` — an operator placed the device by hand.
    ManualLocation { lat: f64, lng: f64 },
    /// `{appId, data}` application message. `raw` keeps the original JSON
    /// for verbatim republication.
    App {
        app_id: String,
        data: String,
        raw: Value,
    },
}

impl InboundMessage {
    pub fn parse(value: Value) -> DomainResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| DomainError::InvalidMessage("payload is not a JSON object".into()))?;

        if object.contains_key("state") {
            return Ok(InboundMessage::ShadowUpdate(value));
        }

        if let Some(geo) = object.get("geo") {
            let pair = geo
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| {
                    DomainError::InvalidMessage(format!("geo is not a [lat, lng] pair: {}", geo))
                })?;
            let lat = coordinate_value(&pair[0])?;
            let lng = coordinate_value(&pair[1])?;
            return Ok(InboundMessage::ManualLocation { lat, lng });
        }

        let app_id = object.get("appId").and_then(Value::as_str);
        let data = object.get("data").and_then(Value::as_str);
        match (app_id, data) {
            (Some(app_id), Some(data)) => Ok(InboundMessage::App {
                app_id: app_id.to_string(),
                data: data.to_string(),
                raw: value.clone(),
            }),
            _ => Err(DomainError::InvalidMessage(format!(
                "unrecognized message shape: {}",
                value
            ))),
        }
    }
}

// Manual overrides arrive with coordinates as numbers or numeric strings.
fn coordinate_value(value: &Value) -> DomainResult<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| {
            DomainError::InvalidMessage(format!("coordinate out of range: {}", n))
        }),
        Value::String(s) => s.trim().parse().map_err(|_| {
            DomainError::InvalidMessage(format!("non-numeric coordinate: {:?}", s))
        }),
        other => Err(DomainError::InvalidMessage(format!(
            "coordinate is not a number: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shadow_update_is_detected_by_state_key() {
        let value = json!({"state": {"reported": {"device": {}}}});
        assert_eq!(
            InboundMessage::parse(value.clone()).unwrap(),
            InboundMessage::ShadowUpdate(value)
        );
    }

    #[test]
    fn manual_location_accepts_numeric_strings() {
        let msg = InboundMessage::parse(json!({"geo": ["63.42", "10.43"]})).unwrap();
        assert_eq!(
            msg,
            InboundMessage::ManualLocation {
                lat: 63.42,
                lng: 10.43
            }
        );
    }

    #[test]
    fn manual_location_accepts_numbers() {
        let msg = InboundMessage::parse(json!({"geo": [63.42, 10.43]})).unwrap();
        assert_eq!(
            msg,
            InboundMessage::ManualLocation {
                lat: 63.42,
                lng: 10.43
            }
        );
    }

    #[test]
    fn app_message_keeps_raw_payload() {
        let value = json!({"appId": "TEMP", "messageType": "DATA", "data": "24.5"});
        let InboundMessage::App { app_id, data, raw } =
            InboundMessage::parse(value.clone()).unwrap()
        else {
            panic!("expected app message");
        };
        assert_eq!(app_id, "TEMP");
        assert_eq!(data, "24.5");
        assert_eq!(raw, value);
    }

    #[test]
    fn unrecognized_shapes_are_rejected() {
        assert!(InboundMessage::parse(json!(["not", "an", "object"])).is_err());
        assert!(InboundMessage::parse(json!({"foo": 1})).is_err());
        assert!(InboundMessage::parse(json!({"geo": [1.0]})).is_err());
        assert!(InboundMessage::parse(json!({"appId": "TEMP"})).is_err());
    }

    #[test]
    fn pressure_is_scaled_to_hpa() {
        let AppTransform::Tracked(reading) = DeviceReading::classify(APP_PRESSURE, "98.5").unwrap()
        else {
            panic!("expected tracked reading");
        };
        assert_eq!(reading, DeviceReading::Pressure(985.0));
        assert_eq!(reading.field(), "pressure");
    }

    #[test]
    fn rsrp_sentinel_is_filtered() {
        assert_eq!(
            DeviceReading::classify(APP_SIGNAL, "5").unwrap(),
            AppTransform::Filtered
        );
        assert_eq!(
            DeviceReading::classify(APP_SIGNAL, "-80").unwrap(),
            AppTransform::Tracked(DeviceReading::SignalStrength(-80.0))
        );
    }

    #[test]
    fn unknown_app_ids_are_untracked() {
        assert_eq!(
            DeviceReading::classify("BUTTON", "1").unwrap(),
            AppTransform::Untracked
        );
    }

    #[test]
    fn non_numeric_tracked_value_is_an_error() {
        assert!(DeviceReading::classify(APP_TEMPERATURE, "warm").is_err());
    }
}

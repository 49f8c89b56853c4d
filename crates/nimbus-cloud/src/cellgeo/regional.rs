use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use nimbus_domain::{
    CellGeolocation, CellLocationProvider, CellQuery, DomainError, DomainResult,
};

/// The self-hosted regional lookup service: a plain GET that either knows
/// the tower or answers with a non-200 status.
pub struct RegionalLocationProvider {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct LocationResponse {
    lat: f64,
    lng: f64,
    accuracy: f64,
}

impl RegionalLocationProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CellLocationProvider for RegionalLocationProvider {
    fn name(&self) -> &'static str {
        "regional"
    }

    async fn locate(&self, query: &CellQuery) -> DomainResult<CellGeolocation> {
        let url = format!("{}/geolocate", self.endpoint);
        let response = self
            .http
            .get(url)
            .query(&[
                ("cell", query.cell_id.to_string()),
                ("area", query.area_code.to_string()),
                ("mccmnc", query.mccmnc.to_string()),
            ])
            .send()
            .await
            .map_err(|e| DomainError::CellLocation(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DomainError::CellLocationNotFound(format!(
                "{} ({})",
                query,
                response.status()
            )));
        }

        let location: LocationResponse = response
            .json()
            .await
            .map_err(|e| DomainError::CellLocation(e.to_string()))?;
        Ok(CellGeolocation {
            lat: location.lat,
            lng: location.lng,
            accuracy: location.accuracy,
            resolved_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses() {
        let raw = r#"{"lat": 63.42, "lng": 10.43, "accuracy": 500}"#;
        let location: LocationResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(location.lat, 63.42);
        assert_eq!(location.accuracy, 500.0);
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let provider = RegionalLocationProvider::new("https://cell.example.com/");
        assert_eq!(provider.endpoint, "https://cell.example.com");
    }
}

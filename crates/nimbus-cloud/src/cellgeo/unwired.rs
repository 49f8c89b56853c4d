use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use nimbus_domain::{
    CellGeolocation, CellLocationProvider, CellQuery, DomainError, DomainResult,
};

/// Commercial fallback: the Unwired Labs LocationAPI. The combined mccmnc
/// is split into its mcc and mnc halves for the request.
pub struct UnwiredProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize, PartialEq, Debug)]
struct UnwiredRequest {
    token: String,
    radio: &'static str,
    mcc: u32,
    mnc: u32,
    cells: Vec<UnwiredCell>,
}

#[derive(Serialize, PartialEq, Debug)]
struct UnwiredCell {
    lac: u32,
    cid: u64,
}

// See the LocationAPI response documentation; only the consumed fields are
// modeled.
#[derive(Deserialize)]
struct UnwiredResponse {
    status: String,
    message: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    accuracy: Option<f64>,
}

fn request_body(api_key: &str, query: &CellQuery) -> UnwiredRequest {
    UnwiredRequest {
        token: api_key.to_string(),
        radio: "lte",
        mcc: query.mccmnc / 100,
        mnc: query.mccmnc % 100,
        cells: vec![UnwiredCell {
            lac: query.area_code,
            cid: query.cell_id,
        }],
    }
}

impl UnwiredProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CellLocationProvider for UnwiredProvider {
    fn name(&self) -> &'static str {
        "unwiredlabs"
    }

    async fn locate(&self, query: &CellQuery) -> DomainResult<CellGeolocation> {
        let url = format!("{}/v2/process.php", self.endpoint);
        let response = self
            .http
            .post(url)
            .json(&request_body(&self.api_key, query))
            .send()
            .await
            .map_err(|e| DomainError::CellLocation(e.to_string()))?;
        let body: UnwiredResponse = response
            .json()
            .await
            .map_err(|e| DomainError::CellLocation(e.to_string()))?;

        if body.status != "ok" {
            return Err(DomainError::CellLocationNotFound(format!(
                "{}: {}",
                query,
                body.message.unwrap_or_else(|| "unknown reason".to_string())
            )));
        }
        match (body.lat, body.lon) {
            (Some(lat), Some(lon)) => Ok(CellGeolocation {
                lat,
                lng: lon,
                accuracy: body.accuracy.unwrap_or(0.0),
                resolved_at: Utc::now(),
            }),
            _ => Err(DomainError::CellLocation(format!(
                "{}: ok response without coordinates",
                query
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mccmnc_is_split_into_mcc_and_mnc() {
        let query = CellQuery {
            mccmnc: 24201,
            area_code: 30401,
            cell_id: 21_627_653,
        };
        let body = request_body("secret", &query);
        assert_eq!(body.mcc, 242);
        assert_eq!(body.mnc, 1);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "token": "secret",
                "radio": "lte",
                "mcc": 242,
                "mnc": 1,
                "cells": [{ "lac": 30401, "cid": 21_627_653 }]
            })
        );
    }

    #[test]
    fn ok_response_parses() {
        let raw = json!({
            "status": "ok",
            "balance": 99,
            "lat": 63.42,
            "lon": 10.43,
            "accuracy": 500
        });
        let body: UnwiredResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(body.status, "ok");
        assert_eq!(body.lat, Some(63.42));
    }

    #[test]
    fn error_response_parses() {
        let raw = json!({
            "status": "error",
            "message": "No matches found",
            "balance": 99
        });
        let body: UnwiredResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(body.status, "error");
        assert_eq!(body.message.as_deref(), Some("No matches found"));
        assert!(body.lat.is_none());
    }
}

use crate::error::BridgeError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

/// Reads a meter's identity and readings. Implementations never retry.
#[async_trait]
pub trait DeviceReader: Send + Sync {
    async fn fetch_identity(&self, host: &str) -> Result<DeviceIdentity, BridgeError>;
    async fn fetch_reading(&self, host: &str) -> Result<ReadingSnapshot, BridgeError>;
}

/// Response of `GET /api`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub product_type: String,
    pub firmware_version: String,
}

/// Response of `GET /api/v1/data`. Every field is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingSnapshot {
    #[serde(rename = "total_power_import_t1_kwh")]
    pub import_t1_kwh: f64,
    #[serde(rename = "total_power_import_t2_kwh")]
    pub import_t2_kwh: f64,
    #[serde(rename = "total_power_export_t1_kwh")]
    pub export_t1_kwh: f64,
    #[serde(rename = "total_power_export_t2_kwh")]
    pub export_t2_kwh: f64,
    pub active_power_w: f64,
    pub active_power_l1_w: f64,
    pub active_power_l2_w: f64,
    pub active_power_l3_w: f64,
    pub total_gas_m3: f64,
    pub gas_timestamp: i64,
    pub meter_model: String,
    pub smr_version: i64,
}

/// HTTP client for the HomeWizard local API.
pub struct HomeWizardClient {
    client: reqwest::Client,
}

impl HomeWizardClient {
    pub fn new(timeout: Duration) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BridgeError::HttpClient)?;
        Ok(Self { client })
    }

    async fn get_json<T: DeserializeOwned>(&self, host: &str, path: &str) -> Result<T, BridgeError> {
        let unreachable = |source| BridgeError::Unreachable {
            host: host.to_string(),
            source,
        };

        let response = self
            .client
            .get(format!("http://{host}{path}"))
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::MalformedResponse {
                host: host.to_string(),
                reason: format!("{path} answered with HTTP {status}"),
            });
        }

        let body = response.bytes().await.map_err(unreachable)?;
        serde_json::from_slice(&body).map_err(|e| BridgeError::MalformedResponse {
            host: host.to_string(),
            reason: format!("{path}: {e}"),
        })
    }
}

#[async_trait]
impl DeviceReader for HomeWizardClient {
    async fn fetch_identity(&self, host: &str) -> Result<DeviceIdentity, BridgeError> {
        self.get_json(host, "/api").await
    }

    async fn fetch_reading(&self, host: &str) -> Result<ReadingSnapshot, BridgeError> {
        self.get_json(host, "/api/v1/data").await
    }
}

#[cfg(test)]
mod test_homewizard_client {
    use super::*;

    const DATA_BODY: &str = r#"
        {
            "smr_version": 50,
            "meter_model": "ISKRA 2M550T-101",
            "wifi_ssid": "home",
            "wifi_strength": 100,
            "total_power_import_t1_kwh": 10830.511,
            "total_power_import_t2_kwh": 2948.827,
            "total_power_export_t1_kwh": 1285.951,
            "total_power_export_t2_kwh": 2876.51,
            "active_power_w": -543,
            "active_power_l1_w": -676,
            "active_power_l2_w": 133,
            "active_power_l3_w": 0,
            "total_gas_m3": 2569.646,
            "gas_timestamp": 210606140010
        }
    "#;

    fn client() -> HomeWizardClient {
        HomeWizardClient::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_identity() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"
                {
                    "product_type": "HWE-P1",
                    "product_name": "P1 Meter",
                    "serial": "3c39e7aabbcc",
                    "firmware_version": "2.11",
                    "api_version": "v1"
                }
            "#,
            )
            .create();

        let identity = client().fetch_identity(&server.host_with_port()).await.unwrap();

        assert_eq!(identity.serial, "3c39e7aabbcc");
        assert_eq!(identity.product_type, "HWE-P1");
        assert_eq!(identity.firmware_version, "2.11");
        mock.assert();
    }

    #[tokio::test]
    async fn test_fetch_reading() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/data")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(DATA_BODY)
            .create();

        let reading = client().fetch_reading(&server.host_with_port()).await.unwrap();

        assert_eq!(reading.import_t1_kwh, 10830.511);
        assert_eq!(reading.export_t2_kwh, 2876.51);
        assert_eq!(reading.active_power_w, -543.0);
        assert_eq!(reading.active_power_l2_w, 133.0);
        assert_eq!(reading.gas_timestamp, 210606140010);
        assert_eq!(reading.meter_model, "ISKRA 2M550T-101");
        assert_eq!(reading.smr_version, 50);
        mock.assert();
    }

    #[tokio::test]
    async fn test_missing_field_fails_closed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/data")
            .with_status(200)
            .with_body(DATA_BODY.replace("\"total_gas_m3\": 2569.646,", ""))
            .create();

        let err = client()
            .fetch_reading(&server.host_with_port())
            .await
            .unwrap_err();

        match err {
            BridgeError::MalformedResponse { reason, .. } => {
                assert!(reason.contains("total_gas_m3"), "unexpected reason {reason}")
            }
            other => panic!("Expected MalformedResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_error_status_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/api").with_status(503).create();

        let err = client()
            .fetch_identity(&server.host_with_port())
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        // Nothing listens on the discard port on loopback.
        let err = client().fetch_identity("127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, BridgeError::Unreachable { .. }));
        assert!(err.is_transient());
    }
}

//! HTTP bridge to the prescription backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::gateway::{FetchedPrescriptions, GatewayFault, PrescriptionGateway, VerificationProof};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadProofRequest<'a> {
    correlation_id: &'a str,
    card_handle: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pharmacy_handle: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest<'a> {
    correlation_id: &'a str,
    proof: &'a VerificationProof,
}

/// [`PrescriptionGateway`] over JSON/HTTP.
#[derive(Debug, Clone)]
pub struct HttpPrescriptionGateway {
    client: Client,
    base_url: Option<String>,
}

impl HttpPrescriptionGateway {
    /// Without a base URL every call faults.
    pub fn new(base_url: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayFault> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| GatewayFault::new("Prescription bridge is not configured"))?;
        let url = format!("{}{}", base_url, path);
        debug!(url = %url, "Prescription bridge request");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayFault::new(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(serde_json::from_str::<GatewayFault>(&body)
                .unwrap_or_else(|_| GatewayFault::new(format!("HTTP {}: {}", status, body))));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayFault::new(format!("JSON parse error: {}", e)))
    }
}

#[async_trait]
impl PrescriptionGateway for HttpPrescriptionGateway {
    async fn read_verification_proof(
        &self,
        correlation_id: &str,
        card_handle: &str,
        pharmacy_handle: Option<&str>,
    ) -> Result<VerificationProof, GatewayFault> {
        self.post(
            "/vsd/read",
            &ReadProofRequest {
                correlation_id,
                card_handle,
                pharmacy_handle,
            },
        )
        .await
    }

    async fn fetch_prescriptions(
        &self,
        correlation_id: &str,
        proof: &VerificationProof,
    ) -> Result<FetchedPrescriptions, GatewayFault> {
        self.post(
            "/prescriptions/fetch",
            &FetchRequest {
                correlation_id,
                proof,
            },
        )
        .await
    }
}

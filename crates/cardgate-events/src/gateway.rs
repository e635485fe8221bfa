//! Prescription gateway contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of a fault's error trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultTrace {
    pub code: i64,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Fault raised by the prescription gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct GatewayFault {
    pub message: String,
    #[serde(default)]
    pub trace: Vec<FaultTrace>,
}

impl GatewayFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.trace.push(FaultTrace {
            code,
            error_text: None,
            detail: None,
        });
        self
    }

    /// First trace code, or the message when the fault has no trace.
    pub fn error_code(&self) -> String {
        self.trace
            .first()
            .map(|t| t.code.to_string())
            .unwrap_or_else(|| self.message.clone())
    }
}

/// Insurance eligibility proof read from the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationProof {
    /// Opaque proof as issued by the device (base64)
    pub proof: String,
    /// Event identifier carried by the proof
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Prescriptions fetched for a verification proof.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedPrescriptions {
    /// Prescription access tokens
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Prescription bundles, passed through unchanged
    #[serde(default)]
    pub bundles: Vec<serde_json::Value>,
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Fetches e-prescriptions on behalf of an inserted health card.
#[async_trait]
pub trait PrescriptionGateway: Send + Sync {
    async fn read_verification_proof(
        &self,
        correlation_id: &str,
        card_handle: &str,
        pharmacy_handle: Option<&str>,
    ) -> Result<VerificationProof, GatewayFault>;

    async fn fetch_prescriptions(
        &self,
        correlation_id: &str,
        proof: &VerificationProof,
    ) -> Result<FetchedPrescriptions, GatewayFault>;
}

//! Common test utilities for event pipeline tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cardgate_events::{
    decode_envelope, Event, FetchedPrescriptions, GatewayFault, PrescriptionGateway, RelayClient,
    RelayError, RelayHealth, VerificationProof, CARD_INSERTED,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Gateway returning fixed results.
pub struct ScriptedGateway {
    pub read_fault: Option<GatewayFault>,
    pub fetch_fault: Option<GatewayFault>,
    pub reads: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl ScriptedGateway {
    pub fn succeeding() -> Self {
        Self {
            read_fault: None,
            fetch_fault: None,
            reads: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing_read(fault: GatewayFault) -> Self {
        Self {
            read_fault: Some(fault),
            ..Self::succeeding()
        }
    }

    pub fn failing_fetch(fault: GatewayFault) -> Self {
        Self {
            fetch_fault: Some(fault),
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl PrescriptionGateway for ScriptedGateway {
    async fn read_verification_proof(
        &self,
        _correlation_id: &str,
        card_handle: &str,
        _pharmacy_handle: Option<&str>,
    ) -> Result<VerificationProof, GatewayFault> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match &self.read_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(VerificationProof {
                proof: format!("proof-of-{}", card_handle),
                event_id: Some("2".to_string()),
            }),
        }
    }

    async fn fetch_prescriptions(
        &self,
        _correlation_id: &str,
        _proof: &VerificationProof,
    ) -> Result<FetchedPrescriptions, GatewayFault> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.fetch_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(FetchedPrescriptions {
                tokens: vec!["Task/160.000.100.000.001.05/$accept?ac=777bea0e".to_string()],
                bundles: vec![json!({"resourceType": "Bundle", "id": "4fe2013d"})],
                event_id: None,
            }),
        }
    }
}

/// Relay that keeps every sent message.
#[derive(Default)]
pub struct RecordingRelay {
    pub health: RelayHealth,
    messages: Mutex<Vec<String>>,
    opens: AtomicUsize,
    sent: Notify,
    open_delay: Option<Duration>,
}

impl RecordingRelay {
    /// A relay whose `open` hangs for `delay` and then fails.
    pub fn slow_to_open(delay: Duration) -> Self {
        Self {
            open_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Decoded (type, payload) pairs in send order.
    pub fn envelopes(&self) -> Vec<(String, Value)> {
        self.messages()
            .iter()
            .map(|m| decode_envelope(m).unwrap())
            .collect()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were sent.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.sent.notified();
            if self.messages.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RelayClient for RecordingRelay {
    async fn open(&self) -> Result<(), RelayError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
            return Err(RelayError::Connection("connect timed out".to_string()));
        }
        self.health.set_connected(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.health.is_connected()
    }

    async fn send_message(&self, message: String) -> Result<(), RelayError> {
        self.messages.lock().push(message);
        self.sent.notify_waiters();
        Ok(())
    }
}

pub fn card_inserted(slot_id: &str, ct_id: &str) -> Event {
    Event::new(CARD_INSERTED)
        .with_param("CardHandle", "CardHandleValue")
        .with_param("SlotID", slot_id)
        .with_param("CtID", ct_id)
}

//! Event Dispatcher
//!
//! Reacts to card-inserted events:
//! 1. read the verification proof for the inserted card
//! 2. fetch the prescriptions for that proof
//! 3. relay tokens, bundles and sensor telemetry, in that order
//!
//! When step 1 or 2 faults, only the sensor telemetry is relayed, carrying
//! the fault's error code.
//!
//! Decoded events reach the dispatcher through a bounded queue drained by
//! worker tasks, so gateway latency never stalls frame decoding.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{params, Event};
use crate::gateway::{FetchedPrescriptions, GatewayFault, PrescriptionGateway, VerificationProof};
use crate::relay::{message_types, RelayClient};

/// Card location parameters of an event.
struct CardSlot<'a> {
    slot_id: &'a str,
    ct_id: &'a str,
}

pub struct EventDispatcher {
    gateway: Arc<dyn PrescriptionGateway>,
    relay: Arc<dyn RelayClient>,
    pharmacy_handle: Option<String>,
}

impl EventDispatcher {
    pub fn new(
        gateway: Arc<dyn PrescriptionGateway>,
        relay: Arc<dyn RelayClient>,
        pharmacy_handle: Option<String>,
    ) -> Self {
        Self {
            gateway,
            relay,
            pharmacy_handle,
        }
    }

    pub fn relay(&self) -> &Arc<dyn RelayClient> {
        &self.relay
    }

    /// Handle one event. Events other than card-inserted are ignored.
    pub async fn dispatch(&self, event: Event) {
        if !event.is_card_inserted() {
            debug!(topic = %event.topic, "Ignoring event");
            return;
        }

        let card_handle = event.get(params::CARD_HANDLE).unwrap_or_default();
        let slot = CardSlot {
            slot_id: event.get(params::SLOT_ID).unwrap_or_default(),
            ct_id: event.get(params::CT_ID).unwrap_or_default(),
        };
        let correlation_id = Uuid::new_v4().to_string();
        info!(
            correlation_id = %correlation_id,
            card_handle = %card_handle,
            slot_id = %slot.slot_id,
            ct_id = %slot.ct_id,
            "Card inserted"
        );

        match self.fetch(&correlation_id, card_handle).await {
            Ok((proof, fetched)) => {
                let event_id = proof.event_id.or(fetched.event_id);
                self.relay
                    .send_envelope(
                        message_types::TOKENS,
                        &json!({
                            "tokens": fetched.tokens,
                            "slotId": slot.slot_id,
                            "ctId": slot.ct_id,
                            "correlationId": correlation_id,
                        }),
                    )
                    .await;
                self.relay
                    .send_envelope(
                        message_types::BUNDLES,
                        &json!({
                            "bundles": fetched.bundles,
                            "slotId": slot.slot_id,
                            "ctId": slot.ct_id,
                            "correlationId": correlation_id,
                        }),
                    )
                    .await;
                self.send_sensor_data(&slot, "eventId", json!(event_id))
                    .await;
            }
            Err(fault) => {
                warn!(correlation_id = %correlation_id, "Prescription workflow failed: {}", fault);
                self.send_sensor_data(&slot, "err", json!(fault.error_code()))
                    .await;
            }
        }
    }

    async fn fetch(
        &self,
        correlation_id: &str,
        card_handle: &str,
    ) -> Result<(VerificationProof, FetchedPrescriptions), GatewayFault> {
        let proof = self
            .gateway
            .read_verification_proof(correlation_id, card_handle, self.pharmacy_handle.as_deref())
            .await?;
        let fetched = self.gateway.fetch_prescriptions(correlation_id, &proof).await?;
        Ok((proof, fetched))
    }

    async fn send_sensor_data(&self, slot: &CardSlot<'_>, key: &str, value: Value) {
        let mut payload = json!({
            "slotId": slot.slot_id,
            "ctId": slot.ct_id,
            "endTime": Utc::now().timestamp_millis(),
        });
        payload[key] = value;
        self.relay
            .send_envelope(message_types::SENSOR_DATA, &payload)
            .await;
    }

    /// Start `workers` tasks draining `queue` until it is closed.
    pub fn spawn_workers(
        self: Arc<Self>,
        queue: async_channel::Receiver<Event>,
        workers: usize,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let dispatcher = self.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    while let Ok(event) = queue.recv().await {
                        dispatcher.dispatch(event).await;
                    }
                    debug!(worker, "Dispatch worker stopped");
                })
            })
            .collect()
    }
}

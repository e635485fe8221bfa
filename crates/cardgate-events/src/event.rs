//! Events pushed by a device.

use serde::{Deserialize, Serialize};

/// Topic of the event that starts the prescription workflow.
pub const CARD_INSERTED: &str = "CARD/INSERTED";

/// Parameter names of a card-inserted event.
pub mod params {
    pub const CARD_HANDLE: &str = "CardHandle";
    pub const SLOT_ID: &str = "SlotID";
    pub const CT_ID: &str = "CtID";
}

/// One decoded device event.
///
/// Parameters keep their wire order. Keys may repeat; lookups return the
/// last value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub parameters: Vec<(String, String)>,
}

impl Event {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_card_inserted(&self) -> bool {
        self.topic == CARD_INSERTED
    }
}

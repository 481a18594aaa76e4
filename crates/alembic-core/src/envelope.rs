//! Wire envelope carried on input and output topics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Metadata key holding the event type.
pub const METADATA_KEY_EVENT_TYPE: &str = "type";

/// The only content type the engine honors.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Event type stamped on every envelope the engine emits.
pub const EVENT_TYPE_RESULT: &str = "Result";

/// String-to-string metadata attached to an envelope.
///
/// Ordered so that encoded envelopes are byte-stable.
pub type Metadata = BTreeMap<String, String>;

/// The JSON record format on the log.
///
/// Producers are expected to write `{"eventId", "contentType", "metadata",
/// "data"}`; all fields are optional on decode. An absent or empty
/// `contentType` is treated as JSON, which is what most upstream producers
/// emit in practice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default)]
    pub event_id: String,

    #[serde(default)]
    pub content_type: String,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Build a fresh result envelope around an output value.
    pub fn result(data: serde_json::Value) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(
            METADATA_KEY_EVENT_TYPE.to_string(),
            EVENT_TYPE_RESULT.to_string(),
        );

        Self {
            event_id: Uuid::new_v4().to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            metadata,
            data,
        }
    }

    /// Decode a wire envelope, rejecting content types the engine cannot
    /// interpret.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(raw)?;
        if !envelope.is_json() {
            return Err(Error::UnsupportedContentType(envelope.content_type));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn is_json(&self) -> bool {
        self.content_type.is_empty() || self.content_type == CONTENT_TYPE_JSON
    }

    /// Event type carried in the metadata, empty when absent.
    pub fn event_type(&self) -> &str {
        self.metadata
            .get(METADATA_KEY_EVENT_TYPE)
            .map(String::as_str)
            .unwrap_or("")
    }
}

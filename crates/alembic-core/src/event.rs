//! The decoded event handed to projection scripts.

use serde::Serialize;

use crate::envelope::{EventEnvelope, Metadata, METADATA_KEY_EVENT_TYPE};

/// Metadata key injected with the source partition number.
pub const METADATA_KEY_TOPIC_PARTITION: &str = "topicPartition";

/// Metadata key injected with the record timestamp (Unix nanoseconds).
pub const METADATA_KEY_TIMESTAMP: &str = "timestamp";

/// Log-client context for one consumed record.
///
/// Kept separate from the envelope so event construction stays testable
/// without a broker.
#[derive(Debug, Clone, Default)]
pub struct RecordContext {
    /// Routing key of the record, empty when the producer set none.
    pub key: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker timestamp in milliseconds, when available.
    pub timestamp_ms: Option<i64>,
}

/// An event as projection scripts observe it.
///
/// Field names serialize in camelCase; scripts read `e.eventType`,
/// `e.data`, `e.metadata.topicPartition` and so on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub data: serde_json::Value,
    pub body: serde_json::Value,
    pub sequence_number: i64,
    /// The record's routing key.
    pub partition: String,
    pub event_type: String,
    pub stream_id: String,
    pub metadata: Metadata,
}

impl Event {
    /// Combine a decoded envelope with log-client context.
    ///
    /// User metadata passes through verbatim; `topicPartition` and
    /// `timestamp` are injected underneath, so a user key wins on
    /// collision.
    pub fn from_envelope(envelope: EventEnvelope, ctx: &RecordContext) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(
            METADATA_KEY_TOPIC_PARTITION.to_string(),
            ctx.partition.to_string(),
        );
        metadata.insert(
            METADATA_KEY_TIMESTAMP.to_string(),
            ctx.timestamp_ms
                .map(|ms| ms.saturating_mul(1_000_000))
                .unwrap_or(0)
                .to_string(),
        );
        for (k, v) in envelope.metadata {
            metadata.insert(k, v);
        }

        let event_type = metadata
            .get(METADATA_KEY_EVENT_TYPE)
            .cloned()
            .unwrap_or_default();

        Self {
            body: envelope.data.clone(),
            data: envelope.data,
            sequence_number: ctx.offset,
            partition: ctx.key.clone(),
            event_type,
            stream_id: ctx.topic.clone(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ctx() -> RecordContext {
        RecordContext {
            key: "user-7".to_string(),
            topic: "orders".to_string(),
            partition: 3,
            offset: 41,
            timestamp_ms: Some(1_700_000_000_123),
        }
    }

    #[test]
    fn test_event_carries_envelope_and_context() {
        let envelope = EventEnvelope::decode(
            br#"{ "metadata": { "type": "OrderPlaced" }, "data": { "total": 9 } }"#,
        )
        .unwrap();

        let event = Event::from_envelope(envelope, &sample_ctx());
        assert_eq!(event.event_type, "OrderPlaced");
        assert_eq!(event.stream_id, "orders");
        assert_eq!(event.partition, "user-7");
        assert_eq!(event.sequence_number, 41);
        assert_eq!(event.data["total"], 9);
    }

    #[test]
    fn test_injected_metadata() {
        let event = Event::from_envelope(EventEnvelope::default(), &sample_ctx());
        assert_eq!(event.metadata[METADATA_KEY_TOPIC_PARTITION], "3");
        assert_eq!(
            event.metadata[METADATA_KEY_TIMESTAMP],
            "1700000000123000000"
        );
    }

    #[test]
    fn test_missing_timestamp_defaults_to_zero() {
        let ctx = RecordContext {
            timestamp_ms: None,
            ..sample_ctx()
        };
        let event = Event::from_envelope(EventEnvelope::default(), &ctx);
        assert_eq!(event.metadata[METADATA_KEY_TIMESTAMP], "0");
    }

    #[test]
    fn test_serializes_camel_case_for_scripts() {
        let event = Event::from_envelope(EventEnvelope::default(), &sample_ctx());
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("eventType").is_some());
        assert!(value.get("sequenceNumber").is_some());
        assert!(value.get("streamId").is_some());
    }
}

//! Notification envelopes.
//!
//! An envelope is the immutable, uniquely identified record of one domain
//! occurrence that requires notification. It is created once at submission
//! and referenced (never owned) by every delivery task derived from it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{Error, Result};

/// Domain event kinds that can trigger notifications.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A fertilization/irrigation/treatment event was logged on a plot.
    EventCreated,
    /// An existing plot event was modified.
    EventUpdated,
    /// An advisor added a recommendation to a campaign or plot.
    RecommendationAdded,
    /// A campaign cost or input threshold was crossed.
    ThresholdExceeded,
    /// A direct message between a producer and an advisor.
    MessageReceived,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventCreated => "event_created",
            Self::EventUpdated => "event_updated",
            Self::RecommendationAdded => "recommendation_added",
            Self::ThresholdExceeded => "threshold_exceeded",
            Self::MessageReceived => "message_received",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event_created" => Some(Self::EventCreated),
            "event_updated" => Some(Self::EventUpdated),
            "recommendation_added" => Some(Self::RecommendationAdded),
            "threshold_exceeded" => Some(Self::ThresholdExceeded),
            "message_received" => Some(Self::MessageReceived),
            _ => None,
        }
    }
}

/// Immutable record of one domain occurrence requiring notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Globally unique identifier, assigned at creation, never reused.
    pub id: String,
    pub event_type: EventType,
    /// Opaque reference to the domain entity (campaign/plot/event id).
    /// The core carries it without interpreting it.
    pub subject_ref: String,
    /// Recipient identities, ordered, duplicates collapsed.
    pub recipients: Vec<String>,
    /// Opaque serialized body; the core treats it as a byte blob.
    #[serde(with = "payload_bytes")]
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl NotificationEnvelope {
    /// JSON body used on the wire (websocket frames, webhook requests).
    ///
    /// The payload is embedded verbatim when it is valid JSON, otherwise
    /// as a base64 string.
    pub fn wire_body(&self) -> Value {
        let payload = match serde_json::from_slice::<Value>(&self.payload) {
            Ok(v) => v,
            Err(_) => Value::String(BASE64.encode(&self.payload)),
        };

        json!({
            "id": self.id,
            "event_type": self.event_type.as_str(),
            "subject_ref": self.subject_ref,
            "payload": payload,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

mod payload_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_bytes(payload)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Bytes, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(de)?;
        Ok(Bytes::from(bytes))
    }
}

/// Normalizes raw domain occurrences into envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    max_payload_bytes: usize,
}

impl EnvelopeBuilder {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    /// Build an envelope from a producer-submitted occurrence.
    ///
    /// Fails with [`Error::InvalidEnvelope`] when `recipients` is empty and
    /// with [`Error::PayloadTooLarge`] when the payload exceeds the
    /// configured maximum. Duplicate recipients are collapsed, first
    /// occurrence wins the position.
    pub fn build(
        &self,
        event_type: EventType,
        subject_ref: impl Into<String>,
        recipients: Vec<String>,
        payload: Bytes,
    ) -> Result<NotificationEnvelope> {
        let recipients = dedupe_preserving_order(recipients);
        if recipients.is_empty() {
            return Err(Error::invalid_envelope("recipients must not be empty"));
        }

        if payload.len() > self.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_bytes,
            });
        }

        Ok(NotificationEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            subject_ref: subject_ref.into(),
            recipients,
            payload,
            created_at: Utc::now(),
        })
    }
}

fn dedupe_preserving_order(recipients: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    recipients
        .into_iter()
        .filter(|r| !r.trim().is_empty())
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new(1024)
    }

    #[test]
    fn empty_recipients_rejected() {
        let err = builder()
            .build(EventType::EventCreated, "campaign-1", vec![], Bytes::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEnvelope(_)));
    }

    #[test]
    fn oversized_payload_rejected() {
        let err = builder()
            .build(
                EventType::EventCreated,
                "campaign-1",
                vec!["producer-1".to_string()],
                Bytes::from(vec![0u8; 2048]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size: 2048, .. }));
    }

    #[test]
    fn duplicate_recipients_collapsed_in_order() {
        let envelope = builder()
            .build(
                EventType::RecommendationAdded,
                "plot-7",
                vec![
                    "advisor-2".to_string(),
                    "producer-1".to_string(),
                    "advisor-2".to_string(),
                ],
                Bytes::from_static(b"{}"),
            )
            .unwrap();
        assert_eq!(envelope.recipients, vec!["advisor-2", "producer-1"]);
    }

    #[test]
    fn wire_body_embeds_json_payload_verbatim() {
        let envelope = builder()
            .build(
                EventType::ThresholdExceeded,
                "campaign-3",
                vec!["admin-1".to_string()],
                Bytes::from_static(br#"{"cost": 1250.5}"#),
            )
            .unwrap();

        let body = envelope.wire_body();
        assert_eq!(body["event_type"], "threshold_exceeded");
        assert_eq!(body["subject_ref"], "campaign-3");
        assert_eq!(body["payload"]["cost"], 1250.5);
    }

    #[test]
    fn wire_body_falls_back_to_base64_for_binary_payload() {
        let envelope = builder()
            .build(
                EventType::EventCreated,
                "plot-1",
                vec!["producer-1".to_string()],
                Bytes::from_static(&[0xff, 0xfe, 0x00]),
            )
            .unwrap();

        let body = envelope.wire_body();
        assert!(body["payload"].is_string());
    }

    #[test]
    fn event_type_roundtrip() {
        assert_eq!(EventType::EventCreated.as_str(), "event_created");
        assert_eq!(
            EventType::parse("threshold_exceeded"),
            Some(EventType::ThresholdExceeded)
        );
        assert_eq!(EventType::parse("unknown"), None);
    }
}

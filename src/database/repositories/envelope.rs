//! Envelope repository.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{Row, SqlitePool};

use crate::database::time;
use crate::dispatch::envelope::{EventType, NotificationEnvelope};
use crate::{Error, Result};

/// Envelope repository trait.
///
/// Envelopes are immutable: insert and lookup only.
#[async_trait]
pub trait EnvelopeRepository: Send + Sync {
    async fn insert(&self, envelope: &NotificationEnvelope) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<NotificationEnvelope>>;
}

/// SQLx implementation of EnvelopeRepository.
pub struct SqlxEnvelopeRepository {
    pool: SqlitePool,
}

impl SqlxEnvelopeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnvelopeRepository for SqlxEnvelopeRepository {
    async fn insert(&self, envelope: &NotificationEnvelope) -> Result<()> {
        let recipients = serde_json::to_string(&envelope.recipients)?;

        sqlx::query(
            r#"
            INSERT INTO notification_envelope (id, event_type, subject_ref, recipients, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&envelope.id)
        .bind(envelope.event_type.as_str())
        .bind(&envelope.subject_ref)
        .bind(recipients)
        .bind(envelope.payload.as_ref())
        .bind(time::datetime_to_ms(envelope.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationEnvelope>> {
        let row = sqlx::query(
            "SELECT id, event_type, subject_ref, recipients, payload, created_at FROM notification_envelope WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let event_type_raw: String = row.get("event_type");
        let event_type = EventType::parse(&event_type_raw).ok_or_else(|| {
            Error::Database(format!("unknown event_type in storage: {}", event_type_raw))
        })?;

        let recipients_raw: String = row.get("recipients");
        let recipients: Vec<String> = serde_json::from_str(&recipients_raw)?;

        let payload: Vec<u8> = row.get("payload");
        let created_at_ms: i64 = row.get("created_at");

        Ok(Some(NotificationEnvelope {
            id: row.get("id"),
            event_type,
            subject_ref: row.get("subject_ref"),
            recipients,
            payload: Bytes::from(payload),
            created_at: time::ms_to_datetime(created_at_ms),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::memory_pool;
    use crate::dispatch::envelope::EnvelopeBuilder;

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let pool = memory_pool().await;
        let repo = SqlxEnvelopeRepository::new(pool);

        let envelope = EnvelopeBuilder::new(1024)
            .build(
                EventType::RecommendationAdded,
                "campaign-9",
                vec!["producer-1".to_string(), "advisor-4".to_string()],
                Bytes::from_static(br#"{"text":"apply nitrogen before rain"}"#),
            )
            .unwrap();

        repo.insert(&envelope).await.unwrap();

        let loaded = repo.get(&envelope.id).await.unwrap().unwrap();
        assert_eq!(loaded.event_type, EventType::RecommendationAdded);
        assert_eq!(loaded.subject_ref, "campaign-9");
        assert_eq!(loaded.recipients, envelope.recipients);
        assert_eq!(loaded.payload, envelope.payload);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let pool = memory_pool().await;
        let repo = SqlxEnvelopeRepository::new(pool);
        assert!(repo.get("no-such-envelope").await.unwrap().is_none());
    }
}

/**
 * PIPELINE D'INGESTION - Traitement d'un message reçu du broker
 *
 * ÉTAPES (pour chaque message, dans l'ordre de réception) :
 * 1. Parser  : topic + payload → Reading, horodatée dans le fuseau de référence
 * 2. Store   : insert attendu avant le message suivant
 * 3. Alertes : politique évaluée pour chaque destinataire enregistré
 * 4. Envoi   : tâche tokio détachée, résultat seulement journalisé
 *
 * Un échec de parsing ou d'insert ne concerne que le message courant :
 * il est journalisé, compté, et le flux continue.
 */

use crate::alerts::{AlertDecision, AlertMessage, AlertPolicy};
use crate::config::AppConfig;
use crate::health::HealthTracker;
use crate::models::{RawMessage, Reading, RecordId};
use crate::notify::NotificationSender;
use crate::parser::{ParseError, ReadingParser};
use crate::ports::{SharedStore, StoreError};
use crate::recipients::RecipientRegistry;
use crate::subscription::MessageHandler;
use async_trait::async_trait;
use std::sync::Arc;
use time::UtcOffset;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("store insert failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub record_id: RecordId,
    pub reading: Reading,
    pub alerts_dispatched: usize,
}

pub struct IngestPipeline {
    parser: ReadingParser,
    offset: UtcOffset,
    store: SharedStore,
    policy: Arc<AlertPolicy>,
    recipients: RecipientRegistry,
    notifier: Arc<NotificationSender>,
    health: HealthTracker,
}

impl IngestPipeline {
    pub fn new(
        parser: ReadingParser,
        offset: UtcOffset,
        store: SharedStore,
        policy: AlertPolicy,
        recipients: RecipientRegistry,
        notifier: Arc<NotificationSender>,
        health: HealthTracker,
    ) -> Self {
        Self {
            parser,
            offset,
            store,
            policy: Arc::new(policy),
            recipients,
            notifier,
            health,
        }
    }

    /// Construction à partir de la config chargée ; le store et le sender sont fournis
    pub fn from_config(
        cfg: &AppConfig,
        store: SharedStore,
        recipients: RecipientRegistry,
        notifier: Arc<NotificationSender>,
        health: HealthTracker,
    ) -> Result<Self, crate::config::ConfigError> {
        Ok(Self::new(
            ReadingParser::new(cfg.topics.temperature.clone(), cfg.topics.smoke.clone()),
            cfg.reference_offset()?,
            store,
            AlertPolicy::new(cfg.alerts.threshold, cfg.alerts.cooldown()),
            recipients,
            notifier,
            health,
        ))
    }

    pub async fn ingest(&self, message: &RawMessage) -> Result<IngestOutcome, IngestError> {
        self.health.record_received();
        let timestamp = message.received_at.to_offset(self.offset);

        let reading = match self.parser.parse(&message.topic, &message.payload, timestamp) {
            Ok(reading) => reading,
            Err(e) => {
                self.health.record_rejected();
                return Err(e.into());
            }
        };

        let record_id = match self.store.insert(&reading) {
            Ok(id) => id,
            Err(e) => {
                self.health.record_store_failure();
                return Err(e.into());
            }
        };
        self.health.record_stored();
        debug!(record_id = %record_id, kind = %reading.kind, value = reading.value, "reading stored");

        let alerts_dispatched = self.dispatch_alerts(&reading);
        Ok(IngestOutcome { record_id, reading, alerts_dispatched })
    }

    fn dispatch_alerts(&self, reading: &Reading) -> usize {
        let recipients = self.recipients.list();
        self.policy.retain_recipients(&recipients);

        let mut dispatched = 0;
        for recipient in recipients {
            match self.policy.evaluate(reading, Some(&recipient)) {
                AlertDecision::Fire => {}
                AlertDecision::Suppressed => {
                    debug!(recipient = %recipient.email, "alert suppressed by cooldown");
                    continue;
                }
                AlertDecision::Ignore => continue,
            }

            let notifier = Arc::clone(&self.notifier);
            let health = self.health.clone();
            let message = AlertMessage::for_reading(reading);
            tokio::spawn(async move {
                match notifier.send(&recipient, &message).await {
                    Ok(()) => {
                        health.record_alert_sent();
                        info!(recipient = %recipient.email, value = message.reading.value, "smoke alert sent");
                    }
                    Err(e) => {
                        health.record_alert_failed();
                        error!(recipient = %recipient.email, error = %e, "smoke alert delivery failed");
                    }
                }
            });
            dispatched += 1;
        }
        dispatched
    }
}

#[async_trait]
impl MessageHandler for IngestPipeline {
    async fn handle(&self, message: RawMessage) {
        match self.ingest(&message).await {
            Ok(outcome) => {
                if outcome.alerts_dispatched > 0 {
                    info!(value = outcome.reading.value, alerts = outcome.alerts_dispatched, "smoke alert triggered");
                }
            }
            Err(IngestError::Parse(e)) => warn!(topic = %message.topic, error = %e, "message rejected"),
            Err(IngestError::Store(e)) => error!(topic = %message.topic, error = %e, "reading dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReadingKind;
    use crate::notify::LogTransport;
    use crate::ports::MemoryStore;
    use std::time::Duration;
    use time::macros::{datetime, offset};

    fn pipeline(store: SharedStore, recipients: RecipientRegistry) -> IngestPipeline {
        pipeline_with_policy(store, recipients, AlertPolicy::default())
    }

    fn pipeline_with_policy(store: SharedStore, recipients: RecipientRegistry, policy: AlertPolicy) -> IngestPipeline {
        IngestPipeline::new(
            ReadingParser::new("iot/temperature", "iot/smoke"),
            offset!(+8),
            store,
            policy,
            recipients,
            Arc::new(NotificationSender::new(Arc::new(LogTransport), 1, Duration::ZERO)),
            HealthTracker::new(),
        )
    }

    fn message(topic: &str, payload: &str) -> RawMessage {
        RawMessage {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
            received_at: datetime!(2024-05-01 02:00:00 UTC),
        }
    }

    #[tokio::test]
    async fn test_reading_is_zoned_and_stored() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), RecipientRegistry::new());

        let outcome = pipeline.ingest(&message("iot/temperature", "Temperature: 42.5 C")).await.unwrap();
        assert_eq!(outcome.reading.timestamp, datetime!(2024-05-01 10:00:00 +08:00));
        assert_eq!(outcome.alerts_dispatched, 0);

        let latest = store.latest(ReadingKind::Temperature).unwrap().unwrap();
        assert_eq!(latest, outcome.reading);
        assert_eq!(latest.timestamp.offset(), offset!(+8));
    }

    #[tokio::test]
    async fn test_rejected_message_is_not_stored() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), RecipientRegistry::new());

        let err = pipeline.ingest(&message("iot/humidity", "Humidity: 40 %")).await.unwrap_err();
        assert!(matches!(err, IngestError::Parse(ParseError::UnknownTopic(_))));
        let err = pipeline.ingest(&message("iot/smoke", "Smoke level")).await.unwrap_err();
        assert!(matches!(err, IngestError::Parse(ParseError::MalformedPayload { .. })));
        assert_eq!(store.info().records, 0);
    }

    #[tokio::test]
    async fn test_one_alert_per_registered_recipient() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let recipients = RecipientRegistry::from_emails(&["ops@example.com", "lead@example.com"]);
        let pipeline = pipeline(store, recipients);

        let outcome = pipeline.ingest(&message("iot/smoke", "Smoke: 3.2 ppm")).await.unwrap();
        assert_eq!(outcome.alerts_dispatched, 2);
        let outcome = pipeline.ingest(&message("iot/smoke", "Smoke: 0 ppm")).await.unwrap();
        assert_eq!(outcome.alerts_dispatched, 0);
        let outcome = pipeline.ingest(&message("iot/temperature", "Temperature: 99 C")).await.unwrap();
        assert_eq!(outcome.alerts_dispatched, 0);
    }

    #[tokio::test]
    async fn test_reregistered_recipient_is_not_under_old_cooldown() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let recipients = RecipientRegistry::from_emails(&["ops@example.com"]);
        let policy = AlertPolicy::new(0.0, Some(time::Duration::minutes(10)));
        let pipeline = pipeline_with_policy(store, recipients.clone(), policy);

        let smoke = message("iot/smoke", "Smoke: 3.2 ppm");
        assert_eq!(pipeline.ingest(&smoke).await.unwrap().alerts_dispatched, 1);
        assert_eq!(pipeline.ingest(&smoke).await.unwrap().alerts_dispatched, 0);

        assert!(recipients.remove("OPS@example.com"));
        assert_eq!(pipeline.ingest(&smoke).await.unwrap().alerts_dispatched, 0);
        recipients.register("Ops@Example.com").unwrap();
        assert_eq!(pipeline.ingest(&smoke).await.unwrap().alerts_dispatched, 1);
    }
}

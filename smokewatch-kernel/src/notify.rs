/**
 * NOTIFICATIONS - Livraison des alertes fumée vers un transport externe
 *
 * TRANSPORTS :
 * - log     : trace uniquement (défaut, aucun service externe requis)
 * - webhook : POST JSON vers une URL, jeton Bearer optionnel
 * - mqtt    : publication JSON sur un topic d'alerte
 *
 * RÉESSAIS :
 * NotificationSender::send retente les échecs transitoires (Unavailable) avec
 * un délai fixe, jusqu'à max_attempts. Un refus définitif (Rejected) n'est pas
 * retenté. L'appelant (pipeline) ne fait que journaliser le résultat.
 */

use crate::alerts::AlertMessage;
use crate::config::{AppConfig, MqttConf, TransportConf};
use crate::models::AlertRecipient;
use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("recipient has no email address")]
    InvalidRecipient,
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Unavailable(_))
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, recipient: &AlertRecipient, message: &AlertMessage) -> Result<(), SendError>;
}

/// Enveloppe envoyée par les transports webhook et mqtt
#[derive(Debug, Serialize)]
struct AlertEnvelope<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
    reading: &'a crate::models::Reading,
}

impl<'a> AlertEnvelope<'a> {
    fn new(recipient: &'a AlertRecipient, message: &'a AlertMessage) -> Self {
        Self {
            recipient: &recipient.email,
            subject: &message.subject,
            body: &message.body,
            reading: &message.reading,
        }
    }
}

#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, recipient: &AlertRecipient, message: &AlertMessage) -> Result<(), SendError> {
        info!(recipient = %recipient.email, subject = %message.subject, "{}", message.body);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| SendError::Unavailable(e.to_string()))?;
        Ok(Self { client, url: url.into(), token })
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, recipient: &AlertRecipient, message: &AlertMessage) -> Result<(), SendError> {
        let mut request = self.client.post(&self.url).json(&AlertEnvelope::new(recipient, message));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(SendError::Rejected(format!("webhook returned {status}")))
        } else {
            Err(SendError::Unavailable(format!("webhook returned {status}")))
        }
    }
}

/// Publie les alertes sur un topic MQTT (connexion dédiée, distincte de l'ingestion)
pub struct MqttTransport {
    client: AsyncClient,
    topic: String,
}

impl MqttTransport {
    /// Doit être appelé depuis un runtime tokio : l'event loop tourne en tâche de fond
    pub fn connect(conf: &MqttConf, topic: impl Into<String>) -> Self {
        let mut opts = MqttOptions::new(format!("{}-alerts", conf.client_id), &conf.host, conf.port);
        opts.set_keep_alive(conf.keep_alive());
        if let Some(user) = &conf.username {
            opts.set_credentials(user, conf.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    debug!(error = %e, "alert transport MQTT error, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        });

        Self { client, topic: topic.into() }
    }
}

#[async_trait]
impl NotificationTransport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn deliver(&self, recipient: &AlertRecipient, message: &AlertMessage) -> Result<(), SendError> {
        let payload = serde_json::to_vec(&AlertEnvelope::new(recipient, message))
            .map_err(|e| SendError::Rejected(e.to_string()))?;
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| SendError::Unavailable(e.to_string()))
    }
}

pub struct NotificationSender {
    transport: Arc<dyn NotificationTransport>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl NotificationSender {
    pub fn new(transport: Arc<dyn NotificationTransport>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            transport,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub async fn send(&self, recipient: &AlertRecipient, message: &AlertMessage) -> Result<(), SendError> {
        if !recipient.is_registered() {
            return Err(SendError::InvalidRecipient);
        }

        let mut attempt = 1;
        loop {
            match self.transport.deliver(recipient, message).await {
                Ok(()) => {
                    debug!(recipient = %recipient.email, attempt, transport = self.transport.name(), "alert delivered");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(recipient = %recipient.email, attempt, error = %e, "alert delivery failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub fn build_transport(cfg: &AppConfig) -> Result<Arc<dyn NotificationTransport>, SendError> {
    let transport: Arc<dyn NotificationTransport> = match &cfg.notifier.transport {
        TransportConf::Log => Arc::new(LogTransport),
        TransportConf::Webhook { url, token } => Arc::new(WebhookTransport::new(url.clone(), token.clone())?),
        TransportConf::Mqtt { topic } => Arc::new(MqttTransport::connect(&cfg.mqtt, topic.clone())),
    };
    Ok(transport)
}

pub fn build_sender(cfg: &AppConfig) -> Result<NotificationSender, SendError> {
    Ok(NotificationSender::new(
        build_transport(cfg)?,
        cfg.notifier.max_attempts,
        cfg.notifier.retry_delay(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Reading, ReadingKind};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use time::macros::datetime;

    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<(), SendError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self { outcomes: Mutex::new(outcomes.into()), calls: Mutex::new(0) })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl NotificationTransport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn deliver(&self, _: &AlertRecipient, _: &AlertMessage) -> Result<(), SendError> {
            *self.calls.lock() += 1;
            self.outcomes.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn message() -> AlertMessage {
        AlertMessage::for_reading(&Reading {
            timestamp: datetime!(2024-05-01 10:00:00 +08:00),
            kind: ReadingKind::Smoke,
            value: 7.0,
        })
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let transport = ScriptedTransport::new(vec![Err(SendError::Unavailable("down".into()))]);
        let sender = NotificationSender::new(transport.clone(), 3, Duration::from_millis(1));
        sender.send(&AlertRecipient::new("ops@example.com"), &message()).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(SendError::Rejected("400".into()))]);
        let sender = NotificationSender::new(transport.clone(), 3, Duration::from_millis(1));
        let err = sender.send(&AlertRecipient::new("ops@example.com"), &message()).await.unwrap_err();
        assert_eq!(err, SendError::Rejected("400".into()));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let down = || Err(SendError::Unavailable("down".into()));
        let transport = ScriptedTransport::new(vec![down(), down(), down(), down()]);
        let sender = NotificationSender::new(transport.clone(), 3, Duration::from_millis(1));
        let err = sender.send(&AlertRecipient::new("ops@example.com"), &message()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_recipient_never_reaches_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let sender = NotificationSender::new(transport.clone(), 3, Duration::from_millis(1));
        let err = sender.send(&AlertRecipient::new("  "), &message()).await.unwrap_err();
        assert_eq!(err, SendError::InvalidRecipient);
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn test_envelope_carries_value() {
        let recipient = AlertRecipient::new("ops@example.com");
        let msg = message();
        let json = serde_json::to_value(AlertEnvelope::new(&recipient, &msg)).unwrap();
        assert_eq!(json["recipient"], "ops@example.com");
        assert_eq!(json["reading"]["value"], 7.0);
        assert_eq!(json["reading"]["kind"], "smoke");
    }

    #[tokio::test]
    async fn test_build_transport_from_config() {
        let mut cfg = AppConfig::default();
        assert_eq!(build_transport(&cfg).unwrap().name(), "log");

        cfg.notifier.transport = TransportConf::Webhook {
            url: "http://127.0.0.1:9/hook".into(),
            token: Some("t".into()),
        };
        assert_eq!(build_sender(&cfg).unwrap().transport_name(), "webhook");
    }
}

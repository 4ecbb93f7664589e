/**
 * MQTT - Connexion broker et session d'abonnement
 *
 * RÔLE :
 * - BrokerConnector : ouvre une session abonnée à une liste de topics
 * - BrokerSession   : flux des messages entrants d'une connexion unique
 * - RumqttConnector : implémentation rumqttc (production)
 *
 * Une session ne se reconnecte jamais elle-même : à la moindre erreur elle
 * rend SessionError::ConnectionLost et c'est le SubscriptionManager qui
 * décide du backoff puis rouvre une session neuve (avec ré-abonnement).
 */

use crate::config::MqttConf;
use crate::models::RawMessage;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, SubscribeReasonCode,
};
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("connection refused by broker: {0}")]
    Refused(String),
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("subscription manager is already running")]
    AlreadyRunning,
    #[error("connection attempt cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connexion + abonnement à tous les topics ; Ok seulement si tout est acquitté
    async fn connect(&self, topics: &[String]) -> Result<Box<dyn BrokerSession>, ConnectError>;
}

#[async_trait]
pub trait BrokerSession: Send {
    /// Prochain message publié ; Err dès que la connexion est perdue
    async fn next_message(&mut self) -> Result<RawMessage, SessionError>;

    /// Désabonnement puis déconnexion propre
    async fn close(&mut self);
}

/// Connecteur rumqttc : une connexion MQTT neuve (clean session) par appel
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    host: String,
    port: u16,
    client_id: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    credentials: Option<(String, String)>,
}

impl RumqttConnector {
    pub fn from_config(conf: &MqttConf) -> Self {
        let credentials = conf
            .username
            .clone()
            .map(|user| (user, conf.password.clone().unwrap_or_default()));
        Self {
            host: conf.host.clone(),
            port: conf.port,
            client_id: conf.client_id.clone(),
            keep_alive: conf.keep_alive(),
            connect_timeout: conf.connect_timeout(),
            credentials,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some((user, password)) = &self.credentials {
            opts.set_credentials(user, password);
        }
        opts
    }
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(&self, topics: &[String]) -> Result<Box<dyn BrokerSession>, ConnectError> {
        let (client, eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);

        // requêtes en file : envoyées par l'event loop juste après le CONNACK
        for topic in topics {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| ConnectError::Subscribe {
                    topic: topic.clone(),
                    reason: e.to_string(),
                })?;
        }

        let mut session = RumqttSession {
            client,
            eventloop,
            topics: topics.to_vec(),
            pending: VecDeque::new(),
        };

        tokio::time::timeout(self.connect_timeout, session.handshake())
            .await
            .map_err(|_| ConnectError::Timeout(self.connect_timeout))??;

        info!(host = %self.host, port = self.port, topics = ?topics, "connected to MQTT broker");
        Ok(Box::new(session))
    }
}

pub struct RumqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: Vec<String>,
    /// Publications reçues pendant l'attente des SUBACK
    pending: VecDeque<RawMessage>,
}

impl RumqttSession {
    /// Attend le CONNACK puis un SUBACK par topic
    async fn handshake(&mut self) -> Result<(), ConnectError> {
        let mut connected = false;
        let mut acked = 0usize;

        while !connected || acked < self.topics.len() {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ConnectError::Refused(format!("{:?}", ack.code)));
                    }
                    connected = true;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    for code in &ack.return_codes {
                        if matches!(code, SubscribeReasonCode::Failure) {
                            let topic = self.topics.get(acked).cloned().unwrap_or_default();
                            return Err(ConnectError::Subscribe {
                                topic,
                                reason: "broker rejected subscription".into(),
                            });
                        }
                        acked += 1;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.pending.push_back(to_raw_message(publish));
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(ConnectError::Refused(format!("{code:?}")));
                }
                Err(e) => return Err(ConnectError::Unreachable(e.to_string())),
            }
        }
        Ok(())
    }
}

fn to_raw_message(publish: Publish) -> RawMessage {
    RawMessage {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
        received_at: OffsetDateTime::now_utc(),
    }
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn next_message(&mut self) -> Result<RawMessage, SessionError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => return Ok(to_raw_message(publish)),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(SessionError::ConnectionLost("broker sent DISCONNECT".into()));
                }
                Ok(_) => {}
                Err(e) => return Err(SessionError::ConnectionLost(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        for topic in &self.topics {
            if let Err(e) = self.client.unsubscribe(topic.as_str()).await {
                debug!(topic = %topic, error = %e, "unsubscribe request failed");
            }
        }
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request failed");
        }

        // l'event loop doit tourner pour émettre UNSUBSCRIBE puis DISCONNECT
        let eventloop = &mut self.eventloop;
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        info!("MQTT session closed");
    }
}

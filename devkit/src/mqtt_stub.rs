/*!
Broker MQTT en mémoire pour tester le SubscriptionManager sans broker réel

Le StubBroker implémente BrokerConnector : chaque connect() ouvre une session
abonnée aux topics demandés. Les tests publient, coupent les connexions ou
refusent les connexions suivantes pour piloter la machine à états.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use smokewatch_kernel::models::RawMessage;
use smokewatch_kernel::mqtt::{BrokerConnector, BrokerSession, ConnectError, SessionError};
use std::sync::Arc;
use tokio::sync::mpsc;

enum SessionEvent {
    Message(RawMessage),
    Drop,
}

struct LiveSession {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct BrokerState {
    sessions: Vec<LiveSession>,
    refuse_next: u32,
    refuse_all: bool,
    connect_attempts: u32,
    closed_sessions: u32,
    subscription_log: Vec<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct StubBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl StubBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publie vers toutes les sessions abonnées ; retourne le nombre de sessions servies
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock();
        state.sessions.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for session in state.sessions.iter().filter(|s| s.topics.iter().any(|t| t == topic)) {
            let message = RawMessage::new(topic, payload.clone());
            if session.tx.send(SessionEvent::Message(message)).is_ok() {
                delivered += 1;
            }
        }
        log::debug!("[stub-broker] published to {topic}: {delivered} session(s)");
        delivered
    }

    /// Coupure réseau simulée : toutes les sessions ouvertes perdent la connexion
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        for session in state.sessions.drain(..) {
            let _ = session.tx.send(SessionEvent::Drop);
        }
        log::info!("[stub-broker] dropped all connections");
    }

    pub fn refuse_next_connects(&self, count: u32) {
        self.state.lock().refuse_next = count;
    }

    pub fn set_refuse_all(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn active_sessions(&self) -> usize {
        self.state.lock().sessions.iter().filter(|s| !s.tx.is_closed()).count()
    }

    /// Sessions fermées proprement via close()
    pub fn closed_sessions(&self) -> u32 {
        self.state.lock().closed_sessions
    }

    /// Topics demandés à chaque connexion réussie, dans l'ordre
    pub fn subscription_log(&self) -> Vec<Vec<String>> {
        self.state.lock().subscription_log.clone()
    }
}

#[async_trait]
impl BrokerConnector for StubBroker {
    async fn connect(&self, topics: &[String]) -> Result<Box<dyn BrokerSession>, ConnectError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.refuse_all {
            return Err(ConnectError::Refused("stub broker refuses all connections".into()));
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(ConnectError::Refused("stub broker refused connection".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.push(LiveSession { topics: topics.to_vec(), tx });
        state.subscription_log.push(topics.to_vec());
        log::info!("[stub-broker] session opened for {:?}", topics);

        Ok(Box::new(StubSession {
            rx,
            broker: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

pub struct StubSession {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    broker: Arc<Mutex<BrokerState>>,
    closed: bool,
}

#[async_trait]
impl BrokerSession for StubSession {
    async fn next_message(&mut self) -> Result<RawMessage, SessionError> {
        match self.rx.recv().await {
            Some(SessionEvent::Message(message)) => Ok(message),
            Some(SessionEvent::Drop) | None => {
                Err(SessionError::ConnectionLost("stub broker dropped the connection".into()))
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        self.broker.lock().closed_sessions += 1;
    }
}

/// Payloads au format capteur "<label>: <valeur> <unité>"
pub struct PayloadBuilder;

impl PayloadBuilder {
    pub fn temperature(value: f64) -> String {
        format!("Temperature: {value} C")
    }

    pub fn smoke(value: f64) -> String {
        format!("Smoke: {value} ppm")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Vec<String> {
        vec!["iot/temperature".into(), "iot/smoke".into()]
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribed_session() {
        let broker = StubBroker::new();
        let mut session = broker.connect(&topics()).await.unwrap();

        assert_eq!(broker.publish("iot/smoke", PayloadBuilder::smoke(1.5)), 1);
        assert_eq!(broker.publish("iot/humidity", "Humidity: 40 %"), 0);

        let message = session.next_message().await.unwrap();
        assert_eq!(message.topic, "iot/smoke");
        assert_eq!(message.payload, b"Smoke: 1.5 ppm");
    }

    #[tokio::test]
    async fn test_drop_and_refuse() {
        let broker = StubBroker::new();
        let mut session = broker.connect(&topics()).await.unwrap();
        broker.drop_connections();
        assert!(session.next_message().await.is_err());
        assert_eq!(broker.active_sessions(), 0);

        broker.refuse_next_connects(1);
        assert!(broker.connect(&topics()).await.is_err());
        assert!(broker.connect(&topics()).await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.subscription_log().len(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_session() {
        let broker = StubBroker::new();
        let mut session = broker.connect(&topics()).await.unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(broker.closed_sessions(), 1);
        assert_eq!(broker.active_sessions(), 0);
        assert_eq!(broker.publish("iot/smoke", PayloadBuilder::smoke(2.0)), 0);
    }
}

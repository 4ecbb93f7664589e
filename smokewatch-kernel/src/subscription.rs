/**
 * SUBSCRIPTION MANAGER - Cycle de vie de la connexion broker et dispatch
 *
 * ÉTATS :
 *   Disconnected → Connecting → Connected          (start)
 *   Connecting → Disconnected                      (échec de start, pas de réessai)
 *   Connected → Connecting → Connected             (coupure inattendue, backoff)
 *   Connecting|Connected → Stopping → Disconnected (stop)
 *
 * FONCTIONNEMENT :
 * - Un worker tokio unique consomme la session : un message à la fois,
 *   le handler est attendu avant de lire le suivant (ordre de réception conservé)
 * - stop() annule le worker puis attend sa fin : aucun handler ne s'exécute
 *   après le retour de stop()
 * - L'état n'est modifiable que par le manager ; les autres composants
 *   en lisent un instantané (state / watch_state)
 */

use crate::config::{IngestConf, ReconnectConf};
use crate::health::HealthTracker;
use crate::mqtt::{BrokerConnector, BrokerSession, ConnectError, SessionError};
use crate::models::RawMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopping,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Callback enregistré une fois à la construction du manager
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: RawMessage);
}

/// Backoff exponentiel borné : initial * multiplier^(attempt-1), plafonné à max
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// None = réessais infinis
    pub max_retries: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConf::default())
    }
}

impl Backoff {
    pub fn from_config(conf: &ReconnectConf) -> Self {
        Self {
            initial: Duration::from_millis(conf.initial_delay_ms),
            max: Duration::from_millis(conf.max_delay_ms),
            multiplier: conf.multiplier.max(1),
            max_retries: conf.max_retries,
        }
    }

    /// Délai avant la tentative `attempt` (à partir de 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt > max)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
    pub backoff: Backoff,
    pub message_timeout: Option<Duration>,
}

impl DispatchSettings {
    pub fn from_config(reconnect: &ReconnectConf, ingest: &IngestConf) -> Self {
        Self {
            backoff: Backoff::from_config(reconnect),
            message_timeout: ingest.message_timeout(),
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tout ce dont le worker a besoin, cloné depuis le manager au démarrage
#[derive(Clone)]
struct DispatchContext {
    connector: Arc<dyn BrokerConnector>,
    handler: Arc<dyn MessageHandler>,
    topics: Vec<String>,
    settings: DispatchSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    health: HealthTracker,
}

pub struct SubscriptionManager {
    ctx: DispatchContext,
    worker: Mutex<Option<Worker>>,
}

impl SubscriptionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        handler: Arc<dyn MessageHandler>,
        topics: Vec<String>,
        settings: DispatchSettings,
        health: HealthTracker,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            ctx: DispatchContext {
                connector,
                handler,
                topics,
                settings,
                state: Arc::new(state),
                health,
            },
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.ctx.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.state.subscribe()
    }

    /// Connexion + abonnement ; en cas d'échec l'erreur est rendue telle quelle, sans réessai
    pub async fn start(&self) -> Result<(), ConnectError> {
        let mut worker = self.worker.lock().await;
        if let Some(current) = worker.as_ref() {
            if !current.handle.is_finished() {
                return Err(ConnectError::AlreadyRunning);
            }
        }
        // worker terminé seul (réessais épuisés ou panique) : on le récupère avant de repartir
        if let Some(finished) = worker.take() {
            if let Err(e) = finished.handle.await {
                error!(error = %e, "dispatch worker panicked");
            }
        }

        self.ctx.state.send_replace(ConnectionState::Connecting);
        info!(topics = ?self.ctx.topics, "connecting to broker");

        let session = match self.ctx.connector.connect(&self.ctx.topics).await {
            Ok(session) => session,
            Err(e) => {
                self.ctx.state.send_replace(ConnectionState::Disconnected);
                warn!(error = %e, "broker connection failed");
                return Err(e);
            }
        };

        self.ctx.state.send_replace(ConnectionState::Connected);
        let cancel = CancellationToken::new();
        let ctx = self.ctx.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { ctx.run(session, token).await });
        *worker = Some(Worker { cancel, handle });
        info!("subscription started");
        Ok(())
    }

    /// start() répété avec le backoff de reconnexion ; utilisé au boot uniquement
    pub async fn start_with_retry(&self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let backoff = &self.ctx.settings.backoff;
        let mut attempt = 1u32;
        loop {
            match self.start().await {
                Ok(()) => return Ok(()),
                Err(ConnectError::AlreadyRunning) => return Err(ConnectError::AlreadyRunning),
                Err(e) if backoff.exhausted(attempt) => return Err(e),
                Err(e) => {
                    let delay = backoff.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "initial connection failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Idempotent ; attend la fin du message en cours de traitement
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        let Some(current) = worker.take() else {
            self.ctx.state.send_if_modified(|state| {
                let changed = *state != ConnectionState::Disconnected;
                *state = ConnectionState::Disconnected;
                changed
            });
            return;
        };

        if !current.handle.is_finished() {
            self.ctx.state.send_replace(ConnectionState::Stopping);
        }
        current.cancel.cancel();
        if let Err(e) = current.handle.await {
            error!(error = %e, "dispatch worker panicked");
        }
        self.ctx.state.send_replace(ConnectionState::Disconnected);
        info!("subscription stopped");
    }
}

impl DispatchContext {
    /// Transition pilotée par le worker ; ignorée si un stop est en cours
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Stopping || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn run(self, mut session: Box<dyn BrokerSession>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = session.next_message() => next,
            };

            match next {
                Ok(message) => self.dispatch(message).await,
                Err(SessionError::ConnectionLost(reason)) => {
                    warn!(reason = %reason, "broker connection lost");
                    self.set_state(ConnectionState::Connecting);
                    self.health.increment_reconnects();
                    match self.reconnect(&cancel).await {
                        Some(fresh) => {
                            session = fresh;
                            self.set_state(ConnectionState::Connected);
                        }
                        None => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
        session.close().await;
    }

    async fn dispatch(&self, message: RawMessage) {
        let span = info_span!("dispatch", topic = %message.topic);
        let handling = self.handler.handle(message).instrument(span);
        match self.settings.message_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, handling).await.is_err() {
                    warn!(timeout_ms = limit.as_millis() as u64, "message processing timed out, dropped");
                }
            }
            None => handling.await,
        }
    }

    /// None si annulé ou si le nombre max de réessais est atteint
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<Box<dyn BrokerSession>> {
        let backoff = &self.settings.backoff;
        let mut attempt = 1u32;
        loop {
            if backoff.exhausted(attempt) {
                error!(attempts = attempt - 1, "giving up reconnecting to broker");
                return None;
            }
            let delay = backoff.delay_for(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = self.connector.connect(&self.topics) => result,
            };
            match result {
                Ok(session) => {
                    info!(attempt, "reconnected and resubscribed");
                    return Some(session);
                }
                Err(e) => warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "reconnect failed"),
            }
            attempt += 1;
        }
    }
}

/*!
Test Harness pour le pipeline d'ingestion

Assemble un SubscriptionManager complet (broker stub, store en mémoire,
transport enregistreur) et fournit des attentes bornées dans le temps
pour les assertions asynchrones.
*/

use crate::mqtt_stub::StubBroker;
use crate::notify_stub::RecordingTransport;
use crate::store_stub::FlakyStore;
use smokewatch_kernel::alerts::AlertPolicy;
use smokewatch_kernel::health::HealthTracker;
use smokewatch_kernel::notify::NotificationSender;
use smokewatch_kernel::parser::ReadingParser;
use smokewatch_kernel::pipeline::IngestPipeline;
use smokewatch_kernel::ports::SharedStore;
use smokewatch_kernel::recipients::RecipientRegistry;
use smokewatch_kernel::subscription::{
    Backoff, ConnectionState, DispatchSettings, MessageHandler, SubscriptionManager,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::macros::offset;

pub const TEMPERATURE_TOPIC: &str = "iot/temperature";
pub const SMOKE_TOPIC: &str = "iot/smoke";
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

pub struct TestHarness {
    pub broker: StubBroker,
    pub store: Arc<FlakyStore>,
    pub transport: Arc<RecordingTransport>,
    pub recipients: RecipientRegistry,
    pub health: HealthTracker,
    pub manager: SubscriptionManager,
}

pub struct HarnessBuilder {
    recipients: Vec<String>,
    cooldown: Option<time::Duration>,
    backoff: Backoff,
    message_timeout: Option<Duration>,
    max_attempts: u32,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            cooldown: None,
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                multiplier: 2,
                max_retries: None,
            },
            message_timeout: None,
            max_attempts: 1,
        }
    }
}

impl HarnessBuilder {
    pub fn recipient(mut self, email: &str) -> Self {
        self.recipients.push(email.to_string());
        self
    }

    pub fn cooldown(mut self, cooldown: time::Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.backoff.max_retries = Some(max_retries);
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn build(self) -> TestHarness {
        env_logger::try_init().ok();

        let broker = StubBroker::new();
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let recipients = RecipientRegistry::from_emails(&self.recipients);
        let health = HealthTracker::new();

        let sender = NotificationSender::new(transport.clone(), self.max_attempts, Duration::from_millis(5));
        let shared_store: SharedStore = store.clone();
        let pipeline = IngestPipeline::new(
            ReadingParser::new(TEMPERATURE_TOPIC, SMOKE_TOPIC),
            offset!(+8),
            shared_store,
            AlertPolicy::new(0.0, self.cooldown),
            recipients.clone(),
            Arc::new(sender),
            health.clone(),
        );

        let manager = SubscriptionManager::new(
            Arc::new(broker.clone()),
            Arc::new(pipeline),
            vec![TEMPERATURE_TOPIC.to_string(), SMOKE_TOPIC.to_string()],
            DispatchSettings { backoff: self.backoff, message_timeout: self.message_timeout },
            health.clone(),
        );

        TestHarness { broker, store, transport, recipients, health, manager }
    }
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Démarre le manager ; panique si la connexion au stub échoue
    pub async fn started(self) -> Self {
        if let Err(e) = self.manager.start().await {
            panic!("harness failed to start: {e}");
        }
        self
    }

    pub fn publish_temperature(&self, value: f64) -> usize {
        self.broker.publish(TEMPERATURE_TOPIC, crate::PayloadBuilder::temperature(value))
    }

    pub fn publish_smoke(&self, value: f64) -> usize {
        self.broker.publish(SMOKE_TOPIC, crate::PayloadBuilder::smoke(value))
    }

    pub fn stored(&self) -> usize {
        use smokewatch_kernel::ports::ReadingStore;
        self.store.info().records
    }

    pub async fn wait_for_records(&self, count: usize) -> bool {
        wait_until(DEFAULT_WAIT, || self.stored() >= count).await
    }

    pub async fn wait_for_state(&self, expected: ConnectionState) -> bool {
        wait_for_state(&self.manager, expected, DEFAULT_WAIT).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Manager branché sur un handler arbitraire plutôt que sur le pipeline complet
pub fn manager_with_handler(
    broker: &StubBroker,
    handler: Arc<dyn MessageHandler>,
    message_timeout: Option<Duration>,
) -> SubscriptionManager {
    env_logger::try_init().ok();
    SubscriptionManager::new(
        Arc::new(broker.clone()),
        handler,
        vec![TEMPERATURE_TOPIC.to_string(), SMOKE_TOPIC.to_string()],
        DispatchSettings { backoff: HarnessBuilder::default().backoff, message_timeout },
        HealthTracker::new(),
    )
}

/// Sonde la condition toutes les 5 ms jusqu'à `limit`
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(limit, polling).await.is_ok()
}

pub async fn wait_for_state(manager: &SubscriptionManager, expected: ConnectionState, limit: Duration) -> bool {
    let mut rx = manager.watch_state();
    within(limit, async move { rx.wait_for(|state| *state == expected).await.is_ok() })
        .await
        .unwrap_or(false)
}

pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, fut).await.ok()
}

/*!
Transport de notification enregistreur

Remplace le webhook / MQTT d'alerte dans les tests : chaque livraison
réussie est conservée, les échecs transitoires sont programmables.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use smokewatch_kernel::alerts::AlertMessage;
use smokewatch_kernel::models::AlertRecipient;
use smokewatch_kernel::notify::{NotificationTransport, SendError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub recipient: AlertRecipient,
    pub message: AlertMessage,
}

#[derive(Default)]
struct Script {
    fail_next: u32,
    always_fail: bool,
    delay: Option<Duration>,
}

#[derive(Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    attempts: Mutex<u32>,
    script: Mutex<Script>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les `count` prochaines livraisons échouent avec SendError::Unavailable
    pub fn fail_next(&self, count: u32) {
        self.script.lock().fail_next = count;
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.script.lock().always_fail = fail;
    }

    /// Latence simulée du service externe
    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().delay = Some(delay);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, recipient: &AlertRecipient, message: &AlertMessage) -> Result<(), SendError> {
        *self.attempts.lock() += 1;

        let (delay, fail) = {
            let mut script = self.script.lock();
            let fail = if script.always_fail {
                true
            } else if script.fail_next > 0 {
                script.fail_next -= 1;
                true
            } else {
                false
            };
            (script.delay, fail)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(SendError::Unavailable("recording transport scripted failure".into()));
        }

        self.deliveries.lock().push(Delivery {
            recipient: recipient.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}

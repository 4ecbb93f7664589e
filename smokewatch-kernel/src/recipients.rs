/**
 * REGISTRE DES DESTINATAIRES - Liste des adresses à prévenir en cas de fumée
 *
 * Alimenté par la config au démarrage puis modifiable à chaud via l'API.
 * Jamais persisté par le store de lectures.
 */

use crate::models::{email_key, AlertRecipient};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecipientError {
    #[error("recipient email is empty")]
    EmptyEmail,
    #[error("recipient {0} already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug, Clone, Default)]
pub struct RecipientRegistry {
    recipients: Arc<Mutex<Vec<AlertRecipient>>>,
}

impl RecipientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les adresses vides ou en double sont ignorées silencieusement
    pub fn from_emails<S: AsRef<str>>(emails: &[S]) -> Self {
        let registry = Self::new();
        for email in emails {
            let _ = registry.register(email.as_ref());
        }
        registry
    }

    pub fn register(&self, email: &str) -> Result<AlertRecipient, RecipientError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(RecipientError::EmptyEmail);
        }
        let key = email_key(email);
        let mut recipients = self.recipients.lock();
        if recipients.iter().any(|r| r.key() == key) {
            return Err(RecipientError::AlreadyRegistered(email.to_string()));
        }
        let recipient = AlertRecipient::new(email);
        recipients.push(recipient.clone());
        Ok(recipient)
    }

    pub fn remove(&self, email: &str) -> bool {
        let key = email_key(email);
        let mut recipients = self.recipients.lock();
        let before = recipients.len();
        recipients.retain(|r| r.key() != key);
        recipients.len() < before
    }

    pub fn list(&self) -> Vec<AlertRecipient> {
        self.recipients.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let registry = RecipientRegistry::new();
        assert!(registry.is_empty());
        registry.register(" ops@example.com ").unwrap();
        assert_eq!(registry.list(), vec![AlertRecipient::new("ops@example.com")]);

        assert_eq!(
            registry.register("OPS@example.com"),
            Err(RecipientError::AlreadyRegistered("OPS@example.com".into()))
        );
        assert_eq!(registry.register("  "), Err(RecipientError::EmptyEmail));

        assert!(registry.remove("Ops@Example.com"));
        assert!(!registry.remove("ops@example.com"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_non_ascii_case_is_one_recipient() {
        let registry = RecipientRegistry::new();
        registry.register("élise@example.com").unwrap();
        assert_eq!(
            registry.register("ÉLISE@example.com"),
            Err(RecipientError::AlreadyRegistered("ÉLISE@example.com".into()))
        );
        assert!(registry.remove("Élise@Example.com"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_from_emails_skips_invalid() {
        let registry = RecipientRegistry::from_emails(&["a@x.io", "", "A@x.io", "b@x.io"]);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = RecipientRegistry::new();
        let view = registry.clone();
        registry.register("a@x.io").unwrap();
        assert_eq!(view.list().len(), 1);
    }
}

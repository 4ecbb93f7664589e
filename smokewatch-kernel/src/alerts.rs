/**
 * ALERT POLICY - Décide si une lecture fumée doit déclencher une notification
 *
 * COMPORTEMENT PAR DÉFAUT :
 * - Seules les lectures Smoke sont concernées
 * - Déclenche si valeur > 0 ET destinataire enregistré (email non vide)
 * - Sans état : chaque message qualifiant déclenche une notification
 *
 * DÉVIATION CONFIGURABLE :
 * - `cooldown` : intervalle minimum entre deux alertes pour un même destinataire
 *   (désactivé par défaut, le comportement historique est conservé)
 * - `threshold` : seuil strict, 0.0 par défaut
 */

use crate::models::{AlertRecipient, Reading, ReadingKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Règle de base, sans cooldown ni seuil configuré
pub fn should_notify(reading: &Reading, recipient: Option<&AlertRecipient>) -> bool {
    qualifies(reading, recipient, 0.0)
}

fn qualifies(reading: &Reading, recipient: Option<&AlertRecipient>, threshold: f64) -> bool {
    reading.kind == ReadingKind::Smoke
        && reading.value > threshold
        && recipient.is_some_and(AlertRecipient::is_registered)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    Fire,
    Ignore,
    /// Qualifiante mais dans la fenêtre de cooldown du destinataire
    Suppressed,
}

#[derive(Debug)]
pub struct AlertPolicy {
    threshold: f64,
    cooldown: Option<Duration>,
    // email normalisé -> timestamp de la dernière alerte émise
    last_fired: Mutex<HashMap<String, OffsetDateTime>>,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::new(0.0, None)
    }
}

impl AlertPolicy {
    pub fn new(threshold: f64, cooldown: Option<Duration>) -> Self {
        Self {
            threshold,
            cooldown,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Le cooldown se mesure sur les timestamps d'ingestion des lectures
    pub fn evaluate(&self, reading: &Reading, recipient: Option<&AlertRecipient>) -> AlertDecision {
        if !qualifies(reading, recipient, self.threshold) {
            return AlertDecision::Ignore;
        }
        let Some(cooldown) = self.cooldown else {
            return AlertDecision::Fire;
        };
        let Some(recipient) = recipient else {
            return AlertDecision::Ignore;
        };

        let key = recipient.key();
        let mut last_fired = self.last_fired.lock();
        if let Some(last) = last_fired.get(&key) {
            if reading.timestamp - *last < cooldown {
                return AlertDecision::Suppressed;
            }
        }
        last_fired.insert(key, reading.timestamp);
        AlertDecision::Fire
    }

    /// Oublie la fenêtre de cooldown des destinataires absents de `current`
    pub fn retain_recipients(&self, current: &[AlertRecipient]) {
        if self.cooldown.is_none() {
            return;
        }
        let mut last_fired = self.last_fired.lock();
        if last_fired.is_empty() {
            return;
        }
        let keys: HashSet<String> = current.iter().map(AlertRecipient::key).collect();
        last_fired.retain(|key, _| keys.contains(key));
    }

    #[cfg(test)]
    fn tracked_recipients(&self) -> usize {
        self.last_fired.lock().len()
    }
}

/// Corps d'alerte rendu, indépendant du transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
    pub reading: Reading,
}

impl AlertMessage {
    pub fn for_reading(reading: &Reading) -> Self {
        let at = reading
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| reading.timestamp.to_string());
        Self {
            subject: format!("Smoke detected: {}", reading.value),
            body: format!(
                "The smoke sensor reported a value of {} at {}. Please check the monitored area.",
                reading.value, at
            ),
            reading: *reading,
        }
    }
}

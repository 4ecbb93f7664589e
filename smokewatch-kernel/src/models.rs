/**
 * MODÈLES - Types partagés du pipeline d'ingestion
 *
 * RÔLE :
 * Représentation typée de ce qui circule entre le broker, le parser,
 * le store et les alertes : message brut, lecture capteur, destinataire.
 *
 * INVARIANTS :
 * - Une Reading est immuable une fois construite (Copy, aucune méthode de mutation)
 * - Le timestamp d'une Reading est l'heure d'ingestion, jamais une heure capteur
 * - Une Reading persistée = exactement un StoreRecord
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Identifiant opaque attribué par le store à chaque enregistrement
pub type RecordId = String;

/// Type de mesure, déterminé uniquement par le topic d'arrivée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingKind {
    Temperature,
    Smoke,
}

impl ReadingKind {
    pub const ALL: [ReadingKind; 2] = [ReadingKind::Temperature, ReadingKind::Smoke];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingKind::Temperature => "temperature",
            ReadingKind::Smoke => "smoke",
        }
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Ok(ReadingKind::Temperature),
            "smoke" => Ok(ReadingKind::Smoke),
            other => Err(format!("unknown reading kind '{other}'")),
        }
    }
}

/// Message tel que reçu du broker, consommé une seule fois par le parser
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Heure de réception (UTC), convertie dans le fuseau de référence à l'ingestion
    pub received_at: OffsetDateTime,
}

impl RawMessage {
    pub fn new<T: Into<String>, P: Into<Vec<u8>>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Lecture capteur validée
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kind: ReadingKind,
    #[serde(with = "sensor_value")]
    pub value: f64,
}

/// Représentation durable d'une Reading : ID du store + lecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: RecordId,
    #[serde(flatten)]
    pub reading: Reading,
}

/// Destinataire d'alerte, fourni de l'extérieur (config ou API)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertRecipient {
    pub email: String,
}

impl AlertRecipient {
    pub fn new<S: Into<String>>(email: S) -> Self {
        Self { email: email.into() }
    }

    /// Un destinataire n'est "enregistré" que si son adresse n'est pas vide
    pub fn is_registered(&self) -> bool {
        !self.email.trim().is_empty()
    }

    /// Clé d'identité partagée par le registre et le cooldown d'alerte
    pub fn key(&self) -> String {
        email_key(&self.email)
    }
}

/// Deux adresses désignent le même destinataire si leurs clés sont égales
pub fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Valeurs non finies (NaN, ±inf) acceptées telles quelles par le parser :
/// JSON ne sait pas les représenter, on les écrit en texte.
mod sensor_value {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(t) => t.parse::<f64>().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(value: f64) -> Reading {
        Reading {
            timestamp: datetime!(2024-05-01 10:00:00 +08:00),
            kind: ReadingKind::Smoke,
            value,
        }
    }

    #[test]
    fn test_reading_json_keeps_offset() {
        let json = serde_json::to_value(reading(3.2)).unwrap();
        assert_eq!(json["kind"], "smoke");
        assert_eq!(json["value"], 3.2);
        assert_eq!(json["timestamp"], "2024-05-01T10:00:00+08:00");
    }

    #[test]
    fn test_non_finite_values_survive_json() {
        for v in [f64::INFINITY, f64::NEG_INFINITY] {
            let txt = serde_json::to_string(&reading(v)).unwrap();
            let back: Reading = serde_json::from_str(&txt).unwrap();
            assert_eq!(back.value, v);
        }
        let txt = serde_json::to_string(&reading(f64::NAN)).unwrap();
        assert!(txt.contains("\"NaN\""));
        let back: Reading = serde_json::from_str(&txt).unwrap();
        assert!(back.value.is_nan());
    }

    #[test]
    fn test_store_record_is_flat() {
        let record = StoreRecord { id: "abc".into(), reading: reading(1.0) };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["kind"], "smoke");
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Smoke".parse::<ReadingKind>(), Ok(ReadingKind::Smoke));
        assert_eq!("temperature".parse::<ReadingKind>(), Ok(ReadingKind::Temperature));
        assert!("humidity".parse::<ReadingKind>().is_err());
    }

    #[test]
    fn test_recipient_registration() {
        assert!(AlertRecipient::new("ops@example.com").is_registered());
        assert!(!AlertRecipient::new("   ").is_registered());
    }

    #[test]
    fn test_recipient_key_folds_unicode_case() {
        assert_eq!(AlertRecipient::new(" ÉLISE@Example.com ").key(), "élise@example.com");
        assert_eq!(email_key("Ops@Example.COM"), email_key("ops@example.com"));
    }
}

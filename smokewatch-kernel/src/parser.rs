/**
 * READING PARSER - Payload brut + topic → Reading typée
 *
 * FORMAT ATTENDU : "<label>: <nombre> <unité...>"  (ex: "Temperature: 42.5 C")
 * La valeur est le premier mot du segment situé entre le premier ':' et le
 * suivant, interprété comme un flottant décimal.
 *
 * Fonction pure : pas d'horloge, pas d'I/O. Le timestamp est fourni par
 * l'appelant (heure d'ingestion).
 */

use crate::models::{Reading, ReadingKind};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: &'static str },
}

fn malformed(reason: &'static str) -> ParseError {
    ParseError::MalformedPayload { reason }
}

/// Associe les deux topics configurés à leur type de mesure
#[derive(Debug, Clone)]
pub struct ReadingParser {
    temperature_topic: String,
    smoke_topic: String,
}

impl ReadingParser {
    pub fn new<T: Into<String>, S: Into<String>>(temperature_topic: T, smoke_topic: S) -> Self {
        Self {
            temperature_topic: temperature_topic.into(),
            smoke_topic: smoke_topic.into(),
        }
    }

    pub fn kind_for(&self, topic: &str) -> Option<ReadingKind> {
        if topic == self.temperature_topic {
            Some(ReadingKind::Temperature)
        } else if topic == self.smoke_topic {
            Some(ReadingKind::Smoke)
        } else {
            None
        }
    }

    /// Le topic est vérifié avant toute tentative de parsing numérique
    pub fn parse(
        &self,
        topic: &str,
        payload: &[u8],
        timestamp: OffsetDateTime,
    ) -> Result<Reading, ParseError> {
        let kind = self
            .kind_for(topic)
            .ok_or_else(|| ParseError::UnknownTopic(topic.to_string()))?;
        let value = extract_value(payload)?;
        Ok(Reading { timestamp, kind, value })
    }
}

/// Extrait la valeur numérique d'un payload "<label>: <nombre> <unité>"
pub fn extract_value(payload: &[u8]) -> Result<f64, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|_| malformed("payload is not valid UTF-8"))?;
    let segment = text
        .split(':')
        .nth(1)
        .ok_or_else(|| malformed("missing ':' separator"))?;
    let token = segment
        .split_whitespace()
        .next()
        .ok_or_else(|| malformed("no value after ':'"))?;
    token
        .parse::<f64>()
        .map_err(|_| malformed("value is not a decimal number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 10:00:00 +08:00);

    fn parser() -> ReadingParser {
        ReadingParser::new("iot/temperature", "iot/smoke")
    }

    fn is_malformed(result: Result<Reading, ParseError>) -> bool {
        matches!(result, Err(ParseError::MalformedPayload { .. }))
    }

    #[test]
    fn test_parse_temperature() {
        let reading = parser().parse("iot/temperature", b"temp: 42.5 C", NOW).unwrap();
        assert_eq!(reading.kind, ReadingKind::Temperature);
        assert_eq!(reading.value, 42.5);
        assert_eq!(reading.timestamp, NOW);
    }

    #[test]
    fn test_parse_smoke() {
        let reading = parser().parse("iot/smoke", b"smoke: 3.2 ppm", NOW).unwrap();
        assert_eq!(reading.kind, ReadingKind::Smoke);
        assert_eq!(reading.value, 3.2);
    }

    #[test]
    fn test_parse_accepts_float_syntax() {
        let p = parser();
        for (payload, expected) in [
            ("Temperature: -4 C", -4.0),
            ("t:17", 17.0),
            ("t:   1e3 units", 1000.0),
            ("t: +0.5", 0.5),
            ("t: .25 C extra words", 0.25),
        ] {
            let reading = p.parse("iot/temperature", payload.as_bytes(), NOW).unwrap();
            assert_eq!(reading.value, expected, "payload {payload:?}");
        }
    }

    #[test]
    fn test_parse_non_finite_accepted() {
        let p = parser();
        assert!(p.parse("iot/smoke", b"smoke: NaN ppm", NOW).unwrap().value.is_nan());
        assert_eq!(p.parse("iot/smoke", b"smoke: inf", NOW).unwrap().value, f64::INFINITY);
        assert_eq!(p.parse("iot/smoke", b"smoke: -5 ppm", NOW).unwrap().value, -5.0);
    }

    #[test]
    fn test_value_is_taken_before_second_colon() {
        let reading = parser().parse("iot/temperature", b"at: 12:30 C", NOW).unwrap();
        assert_eq!(reading.value, 12.0);
    }

    #[test]
    fn test_malformed_payloads() {
        let p = parser();
        assert!(is_malformed(p.parse("iot/temperature", b"42.5 C", NOW)));
        assert!(is_malformed(p.parse("iot/temperature", b"temp:", NOW)));
        assert!(is_malformed(p.parse("iot/temperature", b"temp:    ", NOW)));
        assert!(is_malformed(p.parse("iot/temperature", b"temp: hot C", NOW)));
        assert!(is_malformed(p.parse("iot/temperature", b"temp: 4,2 C", NOW)));
        assert!(is_malformed(p.parse("iot/temperature", b"", NOW)));
        assert!(is_malformed(p.parse("iot/smoke", &[0x73, 0x3a, 0xff, 0xfe], NOW)));
    }

    #[test]
    fn test_unknown_topic_wins_over_payload() {
        let p = parser();
        assert_eq!(
            p.parse("iot/humidity", b"humidity: 40 %", NOW),
            Err(ParseError::UnknownTopic("iot/humidity".into()))
        );
        // payload illisible : toujours UnknownTopic, aucun parsing tenté
        assert_eq!(
            p.parse("iot/other", b"garbage", NOW),
            Err(ParseError::UnknownTopic("iot/other".into()))
        );
    }

    #[test]
    fn test_topic_match_is_exact() {
        assert_eq!(parser().kind_for("iot/smoke/"), None);
        assert_eq!(parser().kind_for("IOT/SMOKE"), None);
    }
}

/**
 * DATA PORTS - Persistance append-only des lectures capteurs
 *
 * RÔLE :
 * Interface commune (ReadingStore) entre le pipeline d'ingestion (écrivain
 * unique) et la couche de présentation (lectrice : dernières valeurs, historique).
 *
 * FONCTIONNEMENT :
 * - insert = ajout uniquement, jamais de mise à jour ni de suppression
 * - lectures triées par timestamp décroissant (à timestamp égal : dernier inséré d'abord)
 * - RecordLog = journal mémoire partagé par les implémentations
 *   (RwLock : lectures concurrentes, un seul écrivain, pas d'écriture partielle visible)
 *
 * IMPLÉMENTATIONS :
 * - MemoryStore : volatile, pour tests et démos
 * - JsonLinesStore : fichier JSON Lines, rechargé au démarrage
 */

pub mod json_lines;
pub mod memory;

pub use json_lines::JsonLinesStore;
pub use memory::MemoryStore;

use crate::config::StoreConf;
use crate::models::{Reading, ReadingKind, RecordId, StoreRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Erreurs possibles lors des opérations sur le store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Informations descriptives d'un store (exposées par /system/health)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub backend: String,
    pub records: usize,
}

/// Interface que toutes les implémentations de store exposent
pub trait ReadingStore: Send + Sync {
    /// Ajoute une lecture, retourne l'ID généré
    fn insert(&self, reading: &Reading) -> Result<RecordId, StoreError>;

    /// Lecture la plus récente pour un type donné
    fn latest(&self, kind: ReadingKind) -> Result<Option<Reading>, StoreError>;

    /// Lectures les plus récentes tous types confondus, `limit` max
    fn recent(&self, limit: usize) -> Result<Vec<Reading>, StoreError>;

    /// Fenêtre d'historique pour un type : lectures depuis `since`, plus récentes d'abord
    fn history(
        &self,
        kind: ReadingKind,
        since: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<Reading>, StoreError>;

    fn info(&self) -> StoreInfo;
}

pub type SharedStore = Arc<dyn ReadingStore>;

/// Ouvre le store décrit par la configuration
pub fn open_store(conf: &StoreConf) -> Result<SharedStore, StoreError> {
    match conf {
        StoreConf::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConf::JsonLines { path } => Ok(Arc::new(JsonLinesStore::open(path)?)),
    }
}

/// Journal mémoire des enregistrements, dans l'ordre de réception
#[derive(Debug)]
pub(crate) struct RecordLog {
    journal: RwLock<Journal>,
}

#[derive(Debug)]
struct Journal {
    records: Vec<StoreRecord>,
    // vrai tant que chaque ajout a un timestamp >= au précédent
    ordered: bool,
}

impl Default for RecordLog {
    fn default() -> Self {
        Self::with_records(Vec::new())
    }
}

impl RecordLog {
    pub(crate) fn with_records(records: Vec<StoreRecord>) -> Self {
        let ordered = records
            .windows(2)
            .all(|pair| pair[0].reading.timestamp <= pair[1].reading.timestamp);
        Self { journal: RwLock::new(Journal { records, ordered }) }
    }

    pub(crate) fn new_record(reading: &Reading) -> StoreRecord {
        StoreRecord {
            id: Uuid::new_v4().to_string(),
            reading: *reading,
        }
    }

    pub(crate) fn append(&self, record: StoreRecord) {
        let mut journal = self.journal.write();
        if let Some(last) = journal.records.last() {
            if record.reading.timestamp < last.reading.timestamp {
                journal.ordered = false;
            }
        }
        journal.records.push(record);
    }

    pub(crate) fn len(&self) -> usize {
        self.journal.read().records.len()
    }

    #[cfg(test)]
    pub(crate) fn is_ordered(&self) -> bool {
        self.journal.read().ordered
    }

    /// Parcourt du plus récent au plus ancien. Journal ordonné : arrêt dès
    /// `limit` résultats ou dès le premier timestamp antérieur à `since`.
    /// Sinon tri stable complet, qui garde l'ordre de réception inversé
    /// pour les timestamps identiques.
    fn select<F>(&self, filter: F, since: Option<OffsetDateTime>, limit: usize) -> Vec<Reading>
    where
        F: Fn(&Reading) -> bool,
    {
        if limit == 0 {
            return Vec::new();
        }
        let in_window = |reading: &Reading| since.map_or(true, |since| reading.timestamp >= since);
        let journal = self.journal.read();
        let newest_first = journal.records.iter().rev().map(|record| record.reading);

        if journal.ordered {
            return newest_first
                .take_while(|reading| in_window(reading))
                .filter(|reading| filter(reading))
                .take(limit)
                .collect();
        }

        let mut out: Vec<Reading> = newest_first
            .filter(|reading| in_window(reading) && filter(reading))
            .collect();
        drop(journal);

        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        out
    }

    pub(crate) fn recent(&self, limit: usize) -> Vec<Reading> {
        self.select(|_| true, None, limit)
    }

    pub(crate) fn latest(&self, kind: ReadingKind) -> Option<Reading> {
        self.select(|r| r.kind == kind, None, 1).into_iter().next()
    }

    pub(crate) fn history(&self, kind: ReadingKind, since: OffsetDateTime, limit: usize) -> Vec<Reading> {
        self.select(|r| r.kind == kind, Some(since), limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-05-01 10:00:00 +08:00);

    fn record(kind: ReadingKind, value: f64, offset_secs: i64) -> StoreRecord {
        RecordLog::new_record(&Reading { timestamp: T0 + Duration::seconds(offset_secs), kind, value })
    }

    fn values(readings: &[Reading]) -> Vec<f64> {
        readings.iter().map(|r| r.value).collect()
    }

    #[test]
    fn test_in_order_appends_stay_ordered() {
        let log = RecordLog::default();
        for i in 0..1000 {
            log.append(record(ReadingKind::Temperature, i as f64, i));
        }
        log.append(record(ReadingKind::Smoke, 5.0, 999));
        assert!(log.is_ordered());

        assert_eq!(values(&log.recent(3)), vec![5.0, 999.0, 998.0]);
        assert_eq!(log.latest(ReadingKind::Temperature).map(|r| r.value), Some(999.0));
        let window = log.history(ReadingKind::Temperature, T0 + Duration::seconds(997), 10);
        assert_eq!(values(&window), vec![999.0, 998.0, 997.0]);
    }

    #[test]
    fn test_out_of_order_append_still_sorts_by_timestamp() {
        let log = RecordLog::default();
        log.append(record(ReadingKind::Smoke, 1.0, 10));
        log.append(record(ReadingKind::Smoke, 2.0, 30));
        // horloge revenue en arrière
        log.append(record(ReadingKind::Smoke, 3.0, 20));
        log.append(record(ReadingKind::Smoke, 4.0, 30));
        assert!(!log.is_ordered());

        assert_eq!(values(&log.recent(10)), vec![4.0, 2.0, 3.0, 1.0]);
        assert_eq!(log.latest(ReadingKind::Smoke).map(|r| r.value), Some(4.0));
        let window = log.history(ReadingKind::Smoke, T0 + Duration::seconds(15), 2);
        assert_eq!(values(&window), vec![4.0, 2.0]);
    }

    #[test]
    fn test_reloaded_records_detect_order() {
        let ordered = RecordLog::with_records(vec![
            record(ReadingKind::Smoke, 1.0, 0),
            record(ReadingKind::Smoke, 2.0, 0),
        ]);
        assert!(ordered.is_ordered());
        assert_eq!(values(&ordered.recent(2)), vec![2.0, 1.0]);

        let shuffled = RecordLog::with_records(vec![
            record(ReadingKind::Smoke, 1.0, 60),
            record(ReadingKind::Smoke, 2.0, 0),
        ]);
        assert!(!shuffled.is_ordered());
        assert_eq!(values(&shuffled.recent(2)), vec![1.0, 2.0]);
    }
}

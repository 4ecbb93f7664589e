use super::{ReadingStore, RecordLog, StoreError, StoreInfo};
use crate::models::{Reading, ReadingKind, RecordId};
use time::OffsetDateTime;

/// Store volatile : tout est perdu à l'arrêt du process
#[derive(Debug, Default)]
pub struct MemoryStore {
    log: RecordLog,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadingStore for MemoryStore {
    fn insert(&self, reading: &Reading) -> Result<RecordId, StoreError> {
        let record = RecordLog::new_record(reading);
        let id = record.id.clone();
        self.log.append(record);
        Ok(id)
    }

    fn latest(&self, kind: ReadingKind) -> Result<Option<Reading>, StoreError> {
        Ok(self.log.latest(kind))
    }

    fn recent(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        Ok(self.log.recent(limit))
    }

    fn history(
        &self,
        kind: ReadingKind,
        since: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        Ok(self.log.history(kind, since, limit))
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            backend: "memory".to_string(),
            records: self.log.len(),
        }
    }
}

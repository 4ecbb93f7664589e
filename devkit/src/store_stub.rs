/*!
Store qui échoue ou ralentit sur commande, pour vérifier que le dispatch
survit aux erreurs d'insert et que stop() attend l'insert en cours.
*/

use parking_lot::Mutex;
use smokewatch_kernel::models::{Reading, ReadingKind, RecordId};
use smokewatch_kernel::ports::{MemoryStore, ReadingStore, StoreError, StoreInfo};
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_inserts: Mutex<u32>,
    insert_delay: Mutex<Option<Duration>>,
    inserts_started: Mutex<u32>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les `count` prochains insert() retournent StoreError::Unavailable
    pub fn fail_inserts(&self, count: u32) {
        *self.failing_inserts.lock() = count;
    }

    /// Disque lent : chaque insert() bloque le thread appelant pendant `delay`
    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock() = Some(delay);
    }

    /// Nombre d'appels à insert(), terminés ou non
    pub fn inserts_started(&self) -> u32 {
        *self.inserts_started.lock()
    }
}

impl ReadingStore for FlakyStore {
    fn insert(&self, reading: &Reading) -> Result<RecordId, StoreError> {
        *self.inserts_started.lock() += 1;
        let delay = *self.insert_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        {
            let mut failing = self.failing_inserts.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::Unavailable("flaky store scripted failure".into()));
            }
        }
        self.inner.insert(reading)
    }

    fn latest(&self, kind: ReadingKind) -> Result<Option<Reading>, StoreError> {
        self.inner.latest(kind)
    }

    fn recent(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        self.inner.recent(limit)
    }

    fn history(&self, kind: ReadingKind, since: OffsetDateTime, limit: usize) -> Result<Vec<Reading>, StoreError> {
        self.inner.history(kind, since, limit)
    }

    fn info(&self) -> StoreInfo {
        StoreInfo { backend: "flaky".into(), ..self.inner.info() }
    }
}

/**
 * STORE JSON LINES - Persistance fichier, une lecture par ligne
 *
 * FONCTIONNEMENT :
 * - Au démarrage : relecture complète du fichier vers le journal mémoire
 * - insert : ligne ajoutée en fin de fichier (mode append) puis publiée en mémoire
 * - Une ligne illisible (écriture interrompue) est ignorée au rechargement
 *
 * Les lecteurs ne touchent jamais au fichier : ils lisent le journal mémoire,
 * l'écrivain tient le verrou fichier uniquement pendant l'écriture.
 */

use super::{ReadingStore, RecordLog, StoreError, StoreInfo};
use crate::models::{Reading, ReadingKind, RecordId, StoreRecord};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{info, warn};

struct Writer {
    file: File,
    /// true si la dernière écriture a pu laisser une ligne incomplète
    needs_newline: bool,
}

pub struct JsonLinesStore {
    path: PathBuf,
    writer: Mutex<Writer>,
    log: RecordLog,
}

impl JsonLinesStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let (records, skipped) = parse_lines(&content);
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "skipped unreadable lines in reading store");
        }
        file.seek(SeekFrom::End(0))?;

        let needs_newline = !content.is_empty() && !content.ends_with('\n');
        info!(path = %path.display(), records = records.len(), "reading store opened");

        Ok(Self {
            path,
            writer: Mutex::new(Writer { file, needs_newline }),
            log: RecordLog::with_records(records),
        })
    }
}

fn parse_lines(content: &str) -> (Vec<StoreRecord>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<StoreRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    (records, skipped)
}

impl ReadingStore for JsonLinesStore {
    fn insert(&self, reading: &Reading) -> Result<RecordId, StoreError> {
        let record = RecordLog::new_record(reading);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut writer = self.writer.lock();
        if writer.needs_newline {
            writer.file.write_all(b"\n")?;
            writer.needs_newline = false;
        }
        if let Err(e) = writer.file.write_all(line.as_bytes()).and_then(|_| writer.file.flush()) {
            writer.needs_newline = true;
            return Err(e.into());
        }

        // publication mémoire sous le verrou écrivain : l'ordre fichier = l'ordre mémoire
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
            backend: format!("json_lines:{}", self.path.display()),
            records: self.log.len(),
        }
    }
}

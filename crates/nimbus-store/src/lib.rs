//! File-backed persistence for the device collection.
//!
//! The whole collection lives in one JSON document keyed by short id. Every
//! mutation rewrites the document to a sibling temp file and renames it over
//! the original, so a crash mid-write cannot corrupt records persisted
//! earlier.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use nimbus_domain::{DeviceRecord, DeviceStore, DomainResult};

pub struct JsonFileStore {
    path: PathBuf,
    // In-memory copy of the document; the file is always rewritten whole.
    records: Mutex<BTreeMap<String, DeviceRecord>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_document(&self, records: &BTreeMap<String, DeviceRecord>) -> DomainResult<()> {
        let document = serde_json::to_string_pretty(records)
            .context("failed to serialize device records")?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, document)
            .await
            .with_context(|| format!("failed to write {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = records.len(), "device records written");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeviceStore for JsonFileStore {
    async fn load(&self) -> DomainResult<Vec<DeviceRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no device store found, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(
                    anyhow::Error::new(e)
                        .context(format!("failed to read {}", self.path.display()))
                        .into(),
                )
            }
        };
        let parsed: BTreeMap<String, DeviceRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;

        let mut records = self.records.lock().await;
        *records = parsed;
        Ok(records.values().cloned().collect())
    }

    async fn persist(&self, record: &DeviceRecord) -> DomainResult<()> {
        let mut records = self.records.lock().await;
        records.insert(record.short_id.clone(), record.clone());
        self.write_document(&records).await
    }
}

//! Ad record upsert store + immutable audit artifact storage for carid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use carid_core::{AdKey, AdRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carid-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("serializing {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash over everything the scraper observed for an ad plus its normalized
/// listing, used to tell a changed re-scrape from an identical one. Updated
/// rule tables therefore refresh the stored listing even when the page text
/// did not change.
pub fn record_content_hash(record: &AdRecord) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(&(
        &record.raw,
        &record.source_url,
        &record.image_urls,
        &record.image_checksums,
        &record.normalized,
    ))
    .map_err(|source| StorageError::Serialize {
        what: "ad record content",
        source,
    })?;
    Ok(sha256_hex(&bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Upserted {
    pub outcome: UpsertOutcome,
    pub record: AdRecord,
}

/// AdRecords keyed by `(source_site, source_id)`. Records are never removed.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<BTreeMap<AdKey, AdRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a first sighting or update the existing row in place.
    ///
    /// `first_seen` and the record id survive every update; `last_seen` only
    /// moves forward.
    pub async fn upsert(&self, mut incoming: AdRecord) -> Result<Upserted, StorageError> {
        incoming.id = incoming.key.ad_id();
        incoming.content_hash = record_content_hash(&incoming)?;

        let mut records = self.records.write().await;
        let Some(existing) = records.get_mut(&incoming.key) else {
            debug!(ad = %incoming.key, "inserting new ad record");
            records.insert(incoming.key.clone(), incoming.clone());
            return Ok(Upserted {
                outcome: UpsertOutcome::Inserted,
                record: incoming,
            });
        };

        existing.last_seen = existing.last_seen.max(incoming.last_seen);
        if existing.content_hash == incoming.content_hash {
            return Ok(Upserted {
                outcome: UpsertOutcome::Unchanged,
                record: existing.clone(),
            });
        }

        existing.source_url = incoming.source_url;
        existing.raw = incoming.raw;
        existing.image_urls = incoming.image_urls;
        existing.image_checksums = incoming.image_checksums;
        existing.normalized = incoming.normalized;
        existing.content_hash = incoming.content_hash;
        debug!(ad = %existing.key, "updated ad record in place");
        Ok(Upserted {
            outcome: UpsertOutcome::Updated,
            record: existing.clone(),
        })
    }

    pub async fn get(&self, key: &AdKey) -> Option<AdRecord> {
        self.records.read().await.get(key).cloned()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Option<AdRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Snapshot of every record, ordered by key.
    pub async fn all(&self) -> Vec<AdRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Operator + reason attached to every separately-authorized cluster change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAuthorization {
    pub operator: String,
    pub reason: String,
}

impl AdminAuthorization {
    pub fn new(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AutoLink,
    ManualLink,
    ManualReject,
    Merge,
    Tombstone,
    Split,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AutoLink => "auto_link",
            AuditAction::ManualLink => "manual_link",
            AuditAction::ManualReject => "manual_reject",
            AuditAction::Merge => "merge",
            AuditAction::Tombstone => "tombstone",
            AuditAction::Split => "split",
        }
    }
}

/// Before/after snapshot of one irreversible cluster action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub action: AuditAction,
    pub subject: Uuid,
    pub authorization: Option<AdminAuthorization>,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        subject: Uuid,
        authorization: Option<AdminAuthorization>,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            action,
            subject,
            authorization,
            before,
            after,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StorageError>;
}

/// In-process audit trail, used by tests and single-run CLI invocations.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once audit artifacts on disk.
#[derive(Debug, Clone)]
pub struct AuditStore {
    root: PathBuf,
}

impl AuditStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(&self, entry: &AuditEntry, content_hash: &str) -> PathBuf {
        let stamp = entry.recorded_at.format("%Y%m%d").to_string();
        PathBuf::from(stamp)
            .join(entry.action.as_str())
            .join(format!("{content_hash}.json"))
    }

    pub async fn write_entry(&self, entry: &AuditEntry) -> Result<StoredArtifact, StorageError> {
        let bytes = serde_json::to_vec_pretty(entry).map_err(|source| StorageError::Serialize {
            what: "audit entry",
            source,
        })?;
        let span = info_span!("audit_write", action = entry.action.as_str(), subject = %entry.subject);
        Ok(self.store_bytes(entry, &bytes).instrument(span).await?)
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    async fn store_bytes(&self, entry: &AuditEntry, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(entry, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating audit directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking audit path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp audit file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp audit file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp audit file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp audit file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Read every stored entry back, oldest first.
    pub async fn load_entries(&self) -> Result<Vec<AuditEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            if !fs::try_exists(&dir)
                .await
                .with_context(|| format!("checking {}", dir.display()))?
            {
                continue;
            }
            let mut read_dir = fs::read_dir(&dir)
                .await
                .with_context(|| format!("reading {}", dir.display()))?;
            while let Some(item) = read_dir
                .next_entry()
                .await
                .with_context(|| format!("listing {}", dir.display()))?
            {
                let path = item.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    let text = fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    let entry: AuditEntry = serde_json::from_str(&text)
                        .with_context(|| format!("parsing {}", path.display()))?;
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }
}

#[async_trait]
impl AuditSink for AuditStore {
    async fn record(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        self.write_entry(entry).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carid_core::{FieldKey, NormalizedListing};
    use serde_json::json;
    use tempfile::tempdir;

    fn ad(site: &str, id: &str, price: &str, seen_at: &str) -> AdRecord {
        let seen_at = DateTime::parse_from_rfc3339(seen_at)
            .expect("ts")
            .with_timezone(&Utc);
        let mut record = AdRecord::new(AdKey::new(site, id), NormalizedListing::default(), seen_at);
        record.raw.insert(FieldKey::Price, price.to_string());
        record
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn reingesting_same_identity_never_duplicates() {
        let store = RecordStore::new();
        let first = store
            .upsert(ad("mobile.bg", "1001", "109 999 лв", "2026-02-24T12:00:00Z"))
            .await
            .unwrap();
        let again = store
            .upsert(ad("mobile.bg", "1001", "109 999 лв", "2026-02-25T12:00:00Z"))
            .await
            .unwrap();
        let changed = store
            .upsert(ad("mobile.bg", "1001", "104 500 лв", "2026-02-26T12:00:00Z"))
            .await
            .unwrap();

        assert_eq!(first.outcome, UpsertOutcome::Inserted);
        assert_eq!(again.outcome, UpsertOutcome::Unchanged);
        assert_eq!(changed.outcome, UpsertOutcome::Updated);
        assert_eq!(store.len().await, 1);

        let stored = store.get(&AdKey::new("mobile.bg", "1001")).await.unwrap();
        assert_eq!(stored.id, first.record.id);
        assert_eq!(stored.first_seen, first.record.first_seen);
        assert_eq!(stored.raw.get(&FieldKey::Price).map(String::as_str), Some("104 500 лв"));
        assert!(stored.last_seen > stored.first_seen);
    }

    #[tokio::test]
    async fn renormalized_listing_with_same_raw_text_is_updated() {
        let store = RecordStore::new();
        let before = ad("mobile.bg", "1003", "109 999 лв", "2026-03-01T00:00:00Z");
        store.upsert(before.clone()).await.unwrap();

        let mut after = ad("mobile.bg", "1003", "109 999 лв", "2026-03-02T00:00:00Z");
        after.normalized.make = Some("BMW".into());
        let upserted = store.upsert(after).await.unwrap();

        assert_eq!(upserted.outcome, UpsertOutcome::Updated);
        assert_eq!(upserted.record.normalized.make.as_deref(), Some("BMW"));
        assert_eq!(upserted.record.raw, before.raw);
    }

    #[tokio::test]
    async fn late_arriving_older_scrape_does_not_rewind_last_seen() {
        let store = RecordStore::new();
        store
            .upsert(ad("mobile.bg", "1002", "1 лв", "2026-03-01T00:00:00Z"))
            .await
            .unwrap();
        let stale = store
            .upsert(ad("mobile.bg", "1002", "1 лв", "2026-02-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(stale.record.last_seen.to_rfc3339(), "2026-03-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn audit_entries_are_written_once_and_read_back() {
        let dir = tempdir().expect("tempdir");
        let store = AuditStore::new(dir.path());
        let entry = AuditEntry::new(
            AuditAction::Tombstone,
            Uuid::new_v4(),
            Some(AdminAuthorization::new("ops", "shared VIN")),
            json!({"status": "active"}),
            json!({"status": "tombstoned"}),
        );

        let first = store.write_entry(&entry).await.expect("first write");
        let second = store.write_entry(&entry).await.expect("second write");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.starts_with(entry.recorded_at.format("%Y%m%d").to_string()));

        let loaded = store.load_entries().await.expect("load");
        assert_eq!(loaded, vec![entry]);
    }
}

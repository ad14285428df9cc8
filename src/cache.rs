//! Local store of retrieved files.
//!
//! Layout under the cache root:
//!
//! ```text
//! {root}/{model}/{YYYYMMDD}/{provider}/{file}                 full files
//! {root}/{model}/{YYYYMMDD}/{provider}/{file}.subset_{key}    subsets
//! {root}/{model}/{YYYYMMDD}/{provider}/{file}.idx             cached indexes
//! {root}/.records/{key}.json                                  one record per retrieval
//! ```
//!
//! A record is only written after its file is complete, so a record on disk
//! always describes a finished retrieval. A record whose file is missing or
//! has the wrong size is treated as corruption: both are removed and the
//! data is fetched again.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::date::yyyymmdd;
use crate::error::{Error, Result};
use crate::inventory::IndexGrammar;

const RECORDS_DIR: &str = ".records";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// SHA-256 of provider, URL and the selected messages (`"full"` for the
    /// whole file).
    pub fn new(provider: &str, url: &str, messages: Option<&[usize]>) -> Self {
        let selected = match messages {
            Some(m) => m.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(","),
            None => "full".to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(selected.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn full(provider: &str, url: &str) -> Self {
        Self::new(provider, url, None)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, used in file names.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: CacheKey,
    pub path: PathBuf,
    pub retrieved_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub provider: String,
    pub url: String,
    /// Selected `message_index` values; `None` for a full file.
    pub messages: Option<Vec<usize>>,
}

/// Where a cached file came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub provider: String,
    pub url: String,
    pub messages: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOutcome {
    pub record: CacheRecord,
    pub hit: bool,
}

pub struct Cache {
    root: PathBuf,
    inflight: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{model}/{YYYYMMDD}/{provider}/{file}`
    ///
    /// Every path is owned by one provider, so two providers never write
    /// the same file.
    pub fn layout_path(
        &self,
        model: &str,
        cycle: DateTime<Utc>,
        provider: &str,
        file_name: &str,
    ) -> PathBuf {
        self.root
            .join(model)
            .join(yyyymmdd(&cycle.date_naive()))
            .join(provider)
            .join(file_name)
    }

    /// `{file}.subset_{key}` next to the full file.
    pub fn subset_path(full_path: &Path, key: &CacheKey) -> PathBuf {
        with_suffix(full_path, &format!("subset_{}", key.short()))
    }

    /// `{file}.idx` / `{file}.index` next to the data file.
    pub fn index_path(data_path: &Path, grammar: IndexGrammar) -> PathBuf {
        with_suffix(data_path, grammar.file_suffix())
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(RECORDS_DIR).join(format!("{key}.json"))
    }

    /// The record for `key` if it and its file are intact.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheRecord>> {
        let path = self.record_path(key);
        let text = match fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CacheRecord = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %key, error = %e, "unreadable cache record, discarding");
                self.invalidate(key).await?;
                return Ok(None);
            }
        };

        match fs::metadata(&record.path).await {
            Ok(meta) if meta.is_file() && meta.len() == record.size_bytes => Ok(Some(record)),
            Ok(meta) => {
                warn!(
                    key = %key,
                    path = %record.path.display(),
                    expected = record.size_bytes,
                    found = meta.len(),
                    "cached file has the wrong size, discarding"
                );
                self.invalidate(key).await?;
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    key = %key,
                    path = %record.path.display(),
                    "cached file is missing, discarding record"
                );
                self.invalidate(key).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return the cached record for `key`, or run `fetch_fn` to produce
    /// `path` and record it.
    ///
    /// Calls for the same key are serialised, so concurrent identical
    /// requests result in a single fetch. `fetch_fn` returns the number of
    /// bytes it wrote; nothing is recorded when it fails.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        path: &Path,
        provenance: Provenance,
        fetch_fn: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        self.serialised(key, path, provenance, true, fetch_fn).await
    }

    /// Run `fetch_fn` even when `key` is cached, replacing the record once
    /// the new file is complete. A failed refresh leaves the old entry.
    pub async fn refresh<F, Fut>(
        &self,
        key: &CacheKey,
        path: &Path,
        provenance: Provenance,
        fetch_fn: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        self.serialised(key, path, provenance, false, fetch_fn).await
    }

    async fn serialised<F, Fut>(
        &self,
        key: &CacheKey,
        path: &Path,
        provenance: Provenance,
        reuse: bool,
        fetch_fn: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        let lock = {
            let mut map = self.inflight.lock().await;
            Arc::clone(map.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };

        let outcome = {
            let _guard = lock.lock().await;
            self.fetch_locked(key, path, provenance, reuse, fetch_fn).await
        };

        let mut map = self.inflight.lock().await;
        // map + this call
        if Arc::strong_count(&lock) <= 2 {
            map.remove(key);
        }
        outcome
    }

    async fn fetch_locked<F, Fut>(
        &self,
        key: &CacheKey,
        path: &Path,
        provenance: Provenance,
        reuse: bool,
        fetch_fn: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        if reuse {
            if let Some(record) = self.lookup(key).await? {
                debug!(key = %key, path = %record.path.display(), "cache hit");
                return Ok(CacheOutcome { record, hit: true });
            }
        }

        let written = fetch_fn().await?;
        let on_disk = fs::metadata(path).await?.len();
        if on_disk != written {
            return Err(Error::Fetch {
                url: provenance.url,
                attempts: 1,
                reason: format!("wrote {written} bytes but {on_disk} are on disk"),
            });
        }

        let record = CacheRecord {
            key: key.clone(),
            path: path.to_path_buf(),
            retrieved_at: Utc::now(),
            size_bytes: written,
            provider: provenance.provider,
            url: provenance.url,
            messages: provenance.messages,
        };
        self.write_record(&record).await?;
        info!(
            key = %key,
            path = %path.display(),
            bytes = written,
            provider = %record.provider,
            "cached"
        );
        Ok(CacheOutcome { record, hit: false })
    }

    async fn write_record(&self, record: &CacheRecord) -> Result<()> {
        let path = self.record_path(&record.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = with_suffix(&path, "tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove the record for `key` and its file. Returns whether a record
    /// existed.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let record_path = self.record_path(key);
        let text = match fs::read_to_string(&record_path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if let Ok(record) = serde_json::from_str::<CacheRecord>(&text) {
            remove_if_present(&record.path).await?;
        }
        remove_if_present(&record_path).await?;
        debug!(key = %key, "cache entry removed");
        Ok(true)
    }

    /// Remove every record and the files they describe. Returns the number
    /// of records removed.
    pub async fn clear(&self) -> Result<usize> {
        let dir = self.root.join(RECORDS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                remove_if_present(&path).await?;
                continue;
            }
            if self.invalidate(&CacheKey(stem.to_string())).await? {
                removed += 1;
            }
        }
        info!(removed, root = %self.root.display(), "cache cleared");
        Ok(removed)
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

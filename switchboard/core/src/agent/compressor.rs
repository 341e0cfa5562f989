//! Conversation Compressor
//!
//! Bounds the prompt size of the agentic route by summarising old history.
//!
//! Once a history exceeds `threshold` messages, everything except the last
//! `keep_recent` messages is replaced by one summary message. Summaries are
//! keyed by a SHA-256 of the old messages and kept in a [`CompressionStore`]:
//!
//! - **Bounded**: at most `max_entries` digests, oldest evicted first
//! - **LRU**: a hit moves the digest to the young end
//! - **Durable**: persisted as JSON (temp file + rename) so a restart does not
//!   pay for the same summaries again
//!
//! If summarisation fails the request continues with the recent messages only.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::blocking::{BlockingError, BlockingPool};
use crate::conversation::{render_transcript, ChatMessage};

/// Prefix of the summary message that replaces old history
pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

// ============================================================================
// Summarizer
// ============================================================================

/// Summarisation failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("summarization failed: {0}")]
pub struct SummarizeError(pub String);

/// Produces a digest of a conversation transcript
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarise `transcript` (`role: content` lines)
    async fn summarize(&self, transcript: &str) -> Result<String, SummarizeError>;
}

// ============================================================================
// Compression Store
// ============================================================================

/// Persistence failures
#[derive(Debug, Error)]
pub enum CompressionStoreError {
    /// File I/O failed
    #[error("compression store I/O error at {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Stored document is not valid JSON
    #[error("compression store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Blocking pool failure
    #[error(transparent)]
    Blocking(#[from] BlockingError),
}

/// One cached digest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionCacheEntry {
    /// SHA-256 of the summarised messages
    pub hash: String,
    /// The digest
    pub summary: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    entries: Vec<CompressionCacheEntry>,
}

/// Bounded LRU of summaries, optionally persisted to a JSON file
pub struct CompressionStore {
    /// Oldest first
    entries: Mutex<VecDeque<CompressionCacheEntry>>,
    max_entries: usize,
    path: Option<PathBuf>,
    pool: BlockingPool,
}

impl CompressionStore {
    /// A store that never touches disk
    #[must_use]
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
            path: None,
            pool: BlockingPool::new(1),
        }
    }

    /// Open a persisted store, starting empty if the file does not exist
    pub async fn open(
        path: impl Into<PathBuf>,
        max_entries: usize,
        pool: BlockingPool,
    ) -> Result<Self, CompressionStoreError> {
        let path = path.into();
        let read_path = path.clone();
        let raw = pool
            .run(move || match std::fs::read_to_string(&read_path) {
                Ok(raw) => Ok(Some(raw)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(CompressionStoreError::Io {
                    path: read_path,
                    source,
                }),
            })
            .await??;

        let max_entries = max_entries.max(1);
        let mut entries: VecDeque<CompressionCacheEntry> = match raw {
            Some(raw) if !raw.trim().is_empty() => {
                serde_json::from_str::<StoreDocument>(&raw)?.entries.into()
            }
            _ => VecDeque::new(),
        };
        while entries.len() > max_entries {
            entries.pop_front();
        }

        tracing::debug!(path = %path.display(), entries = entries.len(), "Loaded compression store");
        Ok(Self {
            entries: Mutex::new(entries),
            max_entries,
            path: Some(path),
            pool,
        })
    }

    /// Cached summary for `hash`; a hit refreshes its recency
    pub fn get(&self, hash: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.hash == hash)?;
        let entry = entries.remove(pos)?;
        let summary = entry.summary.clone();
        entries.push_back(entry);
        Some(summary)
    }

    /// Insert a summary, evicting the oldest entries past the bound
    pub fn insert(&self, hash: impl Into<String>, summary: impl Into<String>) {
        let hash = hash.into();
        let mut entries = self.entries.lock();
        entries.retain(|e| e.hash != hash);
        entries.push_back(CompressionCacheEntry {
            hash,
            summary: summary.into(),
        });
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Number of digests held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Backing file, if persisted
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the store to its file (no-op for in-memory stores)
    pub async fn persist(&self) -> Result<(), CompressionStoreError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let document = StoreDocument {
            entries: self.entries.lock().iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        self.pool
            .run(move || write_atomically(&path, json.as_bytes()))
            .await?
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CompressionStoreError> {
    let io_err = |source| CompressionStoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

// ============================================================================
// Compressor
// ============================================================================

/// Compression thresholds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionConfig {
    /// History length above which compression applies
    pub threshold: usize,
    /// Most recent messages kept verbatim
    pub keep_recent: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            keep_recent: 8,
        }
    }
}

/// Content hash of a message sequence
#[must_use]
pub fn history_hash(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message.role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
        for call in &message.tool_calls {
            hasher.update([1u8]);
            hasher.update(call.name.as_bytes());
            hasher.update(call.arguments.to_string().as_bytes());
        }
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}

/// Summarises overflow history through a cache
pub struct ConversationCompressor {
    config: CompressionConfig,
    store: CompressionStore,
}

impl ConversationCompressor {
    /// Create a compressor over a store
    pub fn new(config: CompressionConfig, store: CompressionStore) -> Self {
        Self { config, store }
    }

    /// The digest store
    #[must_use]
    pub fn store(&self) -> &CompressionStore {
        &self.store
    }

    /// Thresholds in effect
    #[must_use]
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Summary of `old_messages`, from cache or from `summarizer`
    pub async fn compress(
        &self,
        old_messages: &[ChatMessage],
        summarizer: &dyn Summarizer,
    ) -> Result<String, SummarizeError> {
        let hash = history_hash(old_messages);
        if let Some(summary) = self.store.get(&hash) {
            tracing::debug!(hash = %&hash[..12], "Compression cache hit");
            return Ok(summary);
        }

        let summary = summarizer
            .summarize(&render_transcript(old_messages))
            .await?;
        if summary.trim().is_empty() {
            return Err(SummarizeError("empty summary".to_string()));
        }

        self.store.insert(hash, summary.clone());
        if let Err(e) = self.store.persist().await {
            tracing::warn!(error = %e, "Failed to persist compression store");
        }
        Ok(summary)
    }

    /// Apply compression to a history
    ///
    /// Histories at or below the threshold are returned unchanged. Otherwise
    /// the old part becomes one summary message followed by the recent part;
    /// on summarisation failure only the recent part is kept.
    pub async fn prepare_history(
        &self,
        mut history: Vec<ChatMessage>,
        summarizer: &dyn Summarizer,
    ) -> Vec<ChatMessage> {
        if history.len() <= self.config.threshold {
            return history;
        }

        let split = history.len().saturating_sub(self.config.keep_recent);
        let recent = history.split_off(split);
        let old = history;

        match self.compress(&old, summarizer).await {
            Ok(summary) => {
                let mut out = Vec::with_capacity(recent.len() + 1);
                out.push(ChatMessage::system(format!("{SUMMARY_PREFIX}\n{summary}")));
                out.extend(recent);
                out
            }
            Err(e) => {
                tracing::warn!(
                    dropped = old.len(),
                    error = %e,
                    "History summarization failed, continuing with recent messages"
                );
                recent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Counting {
        calls: AtomicU32,
        fail: bool,
    }

    impl Counting {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Summarizer for Counting {
        async fn summarize(&self, transcript: &str) -> Result<String, SummarizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SummarizeError("backend down".into()));
            }
            Ok(format!("{} lines", transcript.lines().count()))
        }
    }

    fn history(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("question {i}"))
                } else {
                    ChatMessage::assistant(format!("answer {i}"))
                }
            })
            .collect()
    }

    fn compressor(threshold: usize, keep_recent: usize) -> ConversationCompressor {
        ConversationCompressor::new(
            CompressionConfig {
                threshold,
                keep_recent,
            },
            CompressionStore::in_memory(4),
        )
    }

    #[tokio::test]
    async fn test_compress_uses_cache() {
        let compressor = compressor(4, 2);
        let summarizer = Counting::new(false);
        let old = history(6);

        let first = compressor.compress(&old, &summarizer).await.unwrap();
        let second = compressor.compress(&old, &summarizer).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_history_untouched() {
        let compressor = compressor(4, 2);
        let summarizer = Counting::new(false);
        let out = compressor.prepare_history(history(4), &summarizer).await;
        assert_eq!(out, history(4));
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_long_history_summarised() {
        let compressor = compressor(4, 2);
        let summarizer = Counting::new(false);
        let full = history(7);

        let out = compressor.prepare_history(full.clone(), &summarizer).await;
        assert_eq!(out.len(), 3);
        assert!(out[0].content.starts_with(SUMMARY_PREFIX));
        assert!(out[0].content.ends_with("5 lines"));
        assert_eq!(&out[1..], &full[5..]);
    }

    #[tokio::test]
    async fn test_failure_keeps_recent_only() {
        let compressor = compressor(4, 2);
        let summarizer = Counting::new(true);
        let full = history(7);

        let out = compressor.prepare_history(full.clone(), &summarizer).await;
        assert_eq!(out, full[5..].to_vec());
        assert!(compressor.store().is_empty());
    }

    #[test]
    fn test_store_is_bounded_lru() {
        let store = CompressionStore::in_memory(2);
        store.insert("a", "A");
        store.insert("b", "B");
        assert_eq!(store.get("a").as_deref(), Some("A"));
        store.insert("c", "C");

        assert_eq!(store.len(), 2);
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
        assert!(store.get("c").is_some());
    }

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("compression.json");

        let store = CompressionStore::open(&path, 8, BlockingPool::new(1))
            .await
            .unwrap();
        assert!(store.is_empty());
        store.insert("h1", "first digest");
        store.persist().await.unwrap();

        let reopened = CompressionStore::open(&path, 8, BlockingPool::new(1))
            .await
            .unwrap();
        assert_eq!(reopened.get("h1").as_deref(), Some("first digest"));
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persists_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compression.json");
        let store = std::sync::Arc::new(
            CompressionStore::open(&path, 64, BlockingPool::new(8))
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert(format!("h{i}"), format!("digest {i}"));
                store.persist().await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        store.persist().await.unwrap();

        let reopened = CompressionStore::open(&path, 64, BlockingPool::new(1))
            .await
            .unwrap();
        assert_eq!(reopened.len(), 16);
    }

    #[tokio::test]
    async fn test_corrupt_store_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compression.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = CompressionStore::open(&path, 8, BlockingPool::new(1)).await;
        assert!(matches!(result, Err(CompressionStoreError::Corrupt(_))));
    }

    #[test]
    fn test_history_hash_is_content_based() {
        assert_eq!(history_hash(&history(3)), history_hash(&history(3)));
        assert_ne!(history_hash(&history(3)), history_hash(&history(4)));
    }
}

//! Credential Source
//!
//! Supplies the active credential for backend calls. The dispatcher never
//! persists credentials; it only selects, rotates and quarantines them.
//!
//! [`CredentialPool`] is the in-process implementation: an ordered pool with one
//! active slot. Rotation advances to the next non-quarantined credential;
//! quarantine excludes a credential until [`CredentialPool::clear_quarantine`]
//! is called. All state changes happen under one lock so concurrent quarantine
//! and clear operations cannot interleave.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Credential
// ============================================================================

/// A backend credential (API key or token)
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Operator-facing identifier
    pub id: String,
    secret: String,
}

impl Credential {
    /// Create a credential
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    /// The secret value, for building auth headers
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Short stable fingerprint safe to log
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.secret.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Tracked state of one pooled credential
#[derive(Clone, Debug)]
pub struct CredentialState {
    /// The credential
    pub credential: Credential,
    /// Excluded from selection
    pub quarantined: bool,
    /// Why it was quarantined
    pub reason: Option<String>,
    /// Last time it was handed out
    pub last_used_at: Option<DateTime<Utc>>,
}

impl CredentialState {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            quarantined: false,
            reason: None,
            last_used_at: None,
        }
    }
}

/// Credential selection failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// Every credential in the pool is quarantined
    #[error("all {0} credentials are quarantined")]
    AllQuarantined(usize),

    /// Credential lookup failed
    #[error("credential lookup failed: {0}")]
    Lookup(String),
}

// ============================================================================
// Credential Source
// ============================================================================

/// Supplies credentials to the dispatcher
///
/// `get_active` may be I/O bound (vault lookups), so it is async.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// The credential to use for the next call, or `None` if the backend
    /// needs no credential
    async fn get_active(&self) -> Result<Option<Credential>, CredentialError>;

    /// Exclude a credential from future selection
    fn quarantine(&self, credential: &Credential, reason: &str);

    /// Advance to the next usable credential
    fn rotate(&self) -> Option<Credential>;

    /// Number of credentials known to the source
    fn pool_size(&self) -> usize;
}

// ============================================================================
// Credential Pool
// ============================================================================

struct PoolInner {
    states: Vec<CredentialState>,
    active: usize,
}

impl PoolInner {
    fn next_usable_from(&self, start: usize) -> Option<usize> {
        let len = self.states.len();
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| !self.states[idx].quarantined)
    }
}

/// In-process credential pool
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
}

impl CredentialPool {
    /// Create a pool; the first credential starts active
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                states: credentials.into_iter().map(CredentialState::new).collect(),
                active: 0,
            }),
        }
    }

    /// A pool for backends that need no credential
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Clear a quarantine by credential id
    ///
    /// Returns `true` if the credential existed and was quarantined.
    pub fn clear_quarantine(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.states.iter_mut().find(|s| s.credential.id == id) {
            Some(state) if state.quarantined => {
                state.quarantined = false;
                state.reason = None;
                tracing::info!(credential = %id, "Credential quarantine cleared");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every credential's state
    #[must_use]
    pub fn states(&self) -> Vec<CredentialState> {
        self.inner.lock().states.clone()
    }

    /// Number of credentials not quarantined
    #[must_use]
    pub fn usable_count(&self) -> usize {
        self.inner
            .lock()
            .states
            .iter()
            .filter(|s| !s.quarantined)
            .count()
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::empty()
    }
}

#[async_trait]
impl CredentialSource for CredentialPool {
    async fn get_active(&self) -> Result<Option<Credential>, CredentialError> {
        let mut inner = self.inner.lock();
        if inner.states.is_empty() {
            return Ok(None);
        }

        let active = inner.active;
        let idx = inner
            .next_usable_from(active)
            .ok_or(CredentialError::AllQuarantined(inner.states.len()))?;
        inner.active = idx;

        let state = &mut inner.states[idx];
        state.last_used_at = Some(Utc::now());
        Ok(Some(state.credential.clone()))
    }

    fn quarantine(&self, credential: &Credential, reason: &str) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner
            .states
            .iter()
            .position(|s| s.credential.id == credential.id)
        else {
            return;
        };

        let state = &mut inner.states[idx];
        if state.quarantined {
            return;
        }
        state.quarantined = true;
        state.reason = Some(reason.to_string());
        tracing::info!(
            credential = %credential.id,
            fingerprint = %credential.fingerprint(),
            reason,
            "Credential quarantined"
        );

        if inner.active == idx {
            if let Some(next) = inner.next_usable_from(idx + 1) {
                inner.active = next;
            }
        }
    }

    fn rotate(&self) -> Option<Credential> {
        let mut inner = self.inner.lock();
        if inner.states.is_empty() {
            return None;
        }
        let start = inner.active + 1;
        let next = inner.next_usable_from(start)?;
        inner.active = next;
        let credential = inner.states[next].credential.clone();
        tracing::debug!(credential = %credential.id, "Rotated credential");
        Some(credential)
    }

    fn pool_size(&self) -> usize {
        self.inner.lock().states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> CredentialPool {
        CredentialPool::new(vec![
            Credential::new("a", "secret-a"),
            Credential::new("b", "secret-b"),
            Credential::new("c", "secret-c"),
        ])
    }

    #[test]
    fn test_empty_pool_yields_none() {
        let pool = CredentialPool::empty();
        assert_eq!(tokio_test::block_on(pool.get_active()), Ok(None));
        assert!(pool.rotate().is_none());
        assert_eq!(pool.pool_size(), 0);
    }

    #[tokio::test]
    async fn test_rotation_cycles() {
        let pool = pool();
        assert_eq!(pool.get_active().await.unwrap().unwrap().id, "a");
        assert_eq!(pool.rotate().unwrap().id, "b");
        assert_eq!(pool.rotate().unwrap().id, "c");
        assert_eq!(pool.rotate().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_quarantine_skips_credential() {
        let pool = pool();
        let a = pool.get_active().await.unwrap().unwrap();
        pool.quarantine(&a, "auth failed");

        assert_eq!(pool.get_active().await.unwrap().unwrap().id, "b");
        assert_eq!(pool.usable_count(), 2);
        assert_eq!(pool.rotate().unwrap().id, "c");
        assert_eq!(pool.rotate().unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_all_quarantined() {
        let pool = CredentialPool::new(vec![Credential::new("only", "s")]);
        let only = pool.get_active().await.unwrap().unwrap();
        pool.quarantine(&only, "bad");
        assert_eq!(
            pool.get_active().await,
            Err(CredentialError::AllQuarantined(1))
        );

        assert!(pool.clear_quarantine("only"));
        assert!(!pool.clear_quarantine("only"));
        assert_eq!(pool.get_active().await.unwrap().unwrap().id, "only");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cred = Credential::new("k", "super-secret");
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("super-secret"));
        assert_eq!(cred.fingerprint().len(), 12);
    }
}

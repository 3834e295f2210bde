//! TTL-indexed table of generic sessions with background eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::RngCore;
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use crate::constants::EVICTION_SWEEP_INTERVAL;
use crate::error::{ClawkerError, Result};

/// A generic session. Metadata is a string-keyed map of heterogeneous
/// values because different session kinds (today, only "callback") carry
/// different fields; the store itself only cares about `kind` and expiry.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub kind: String,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    metadata: Arc<RwLock<HashMap<String, Value>>>,
}

impl Session {
    fn new(id: String, kind: String, ttl: Duration, initial: HashMap<String, Value>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            kind,
            created_at: now,
            expires_at: now + ttl,
            metadata: Arc::new(RwLock::new(initial)),
        }
    }

    fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }

    /// Reads a metadata value.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    /// Sets a metadata value.
    pub async fn set(&self, key: &str, value: Value) {
        self.metadata.write().await.insert(key.to_string(), value);
    }

    /// Atomically flips `key` from `false` (or absent) to `true`, returning
    /// `true` only for the caller that performed the flip. Concurrent
    /// callers serialize on the metadata write lock, so exactly one wins
    /// regardless of how many call this at once.
    pub async fn capture_once(&self, key: &str) -> bool {
        let mut metadata = self.metadata.write().await;
        let already = metadata.get(key).and_then(Value::as_bool).unwrap_or(false);
        if already {
            return false;
        }
        metadata.insert(key.to_string(), Value::Bool(true));
        true
    }
}

/// Hook invoked with the departing `Session` after it is removed from the
/// store, outside the store's lock. Used by the Host Proxy Server to tear
/// down a dynamic listener when its callback session is deleted.
pub type DeletionHook = Arc<dyn Fn(Session) + Send + Sync>;

struct Inner {
    sessions: RwLock<HashMap<String, Session>>,
    deletion_hook: RwLock<Option<DeletionHook>>,
}

/// A mapping from session id to `Session`, a cleanup timer, and an optional
/// deletion hook.
pub struct SessionStore {
    inner: Arc<Inner>,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    /// Creates a store and starts its background eviction task.
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            deletion_hook: RwLock::new(None),
        });
        let stop = Arc::new(Notify::new());

        let store = Arc::new(Self {
            inner: Arc::clone(&inner),
            stop: Arc::clone(&stop),
            stopped: std::sync::atomic::AtomicBool::new(false),
            sweep_task: std::sync::Mutex::new(None),
        });

        let sweep_inner = inner;
        let sweep_stop = stop;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::sweep(&sweep_inner).await;
                    }
                    _ = sweep_stop.notified() => {
                        return;
                    }
                }
            }
        });
        *store.sweep_task.lock().expect("mutex poisoned") = Some(handle);
        store
    }

    /// Registers the deletion hook. Only one hook is supported; later calls
    /// replace the prior hook.
    pub async fn set_deletion_hook(&self, hook: DeletionHook) {
        *self.inner.deletion_hook.write().await = Some(hook);
    }

    /// Generates a fresh id, installs a new session, and returns it.
    pub async fn create(
        &self,
        kind: &str,
        ttl: Duration,
        initial_metadata: HashMap<String, Value>,
    ) -> Result<Session> {
        let id = generate_session_id();
        let session = Session::new(id.clone(), kind.to_string(), ttl, initial_metadata);
        self.inner
            .sessions
            .write()
            .await
            .insert(id, session.clone());
        Ok(session)
    }

    /// Returns the session if present and non-expired. A present-but-expired
    /// session is evicted (firing the deletion hook) and absent is returned.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let now = SystemTime::now();
        let expired = {
            let sessions = self.inner.sessions.read().await;
            match sessions.get(id) {
                None => return None,
                Some(session) if !session.is_expired_at(now) => return Some(session.clone()),
                Some(_) => true,
            }
        };
        if expired {
            self.remove_and_notify(id).await;
        }
        None
    }

    /// Idempotent removal. Fires the deletion hook (outside the lock) if a
    /// session was actually present.
    pub async fn delete(&self, id: &str) {
        self.remove_and_notify(id).await;
    }

    async fn remove_and_notify(&self, id: &str) {
        let removed = self.inner.sessions.write().await.remove(id);
        if let Some(session) = removed {
            let hook = self.inner.deletion_hook.read().await.clone();
            if let Some(hook) = hook {
                hook(session);
            }
        }
    }

    /// Point-in-time size.
    pub async fn count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Idempotent: stops the periodic eviction task.
    pub fn stop(&self) {
        if self
            .stopped
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.stop.notify_one();
        if let Some(handle) = self.sweep_task.lock().expect("mutex poisoned").take() {
            handle.abort();
        }
    }

    async fn sweep(inner: &Arc<Inner>) {
        let now = SystemTime::now();
        let victims: Vec<Session> = {
            let mut sessions = inner.sessions.write().await;
            let expired_ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired_at(now))
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };
        if victims.is_empty() {
            return;
        }
        let hook = inner.deletion_hook.read().await.clone();
        if let Some(hook) = hook {
            for session in victims {
                hook(session);
            }
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.stop();
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    data_encoding::HEXLOWER.encode(&bytes)
}

/// Validates a caller-supplied TTL is non-zero and within `max`, mapping
/// out-of-range values to a `Validation` error rather than silently
/// clamping.
pub fn validate_ttl(requested: Duration, default: Duration, max: Duration) -> Result<Duration> {
    if requested.is_zero() {
        return Ok(default);
    }
    if requested > max {
        return Err(ClawkerError::validation(format!(
            "ttl {requested:?} exceeds maximum {max:?}"
        )));
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn create_then_get_returns_same_id() {
        let store = SessionStore::new();
        let session = store
            .create("callback", Duration::from_secs(60), HashMap::new())
            .await
            .unwrap();
        let fetched = store.get(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        store.stop();
    }

    #[tokio::test]
    async fn expired_session_is_absent_and_hook_fires_once() {
        let store = SessionStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        store
            .set_deletion_hook(Arc::new(move |_session| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let session = store
            .create("callback", Duration::from_millis(1), HashMap::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store.get(&session.id).await.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second Get must not fire the hook again.
        assert!(store.get(&session.id).await.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        store.stop();
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = SessionStore::new();
        let session = store
            .create("callback", Duration::from_secs(60), HashMap::new())
            .await
            .unwrap();
        store.delete(&session.id).await;
        store.delete(&session.id).await;
        assert_eq!(store.count().await, 0);
        store.stop();
    }

    #[tokio::test]
    async fn capture_once_exactly_one_winner_under_concurrency() {
        let store = SessionStore::new();
        let session = store
            .create("callback", Duration::from_secs(60), HashMap::new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let session = session.clone();
            handles.push(tokio::spawn(
                async move { session.capture_once("received").await },
            ));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        store.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = SessionStore::new();
            store.stop();
            store.stop();
        });
    }

    #[test]
    fn validate_ttl_rejects_over_max() {
        let err = validate_ttl(
            Duration::from_secs(3600),
            Duration::from_secs(300),
            Duration::from_secs(1800),
        );
        assert!(err.is_err());
        assert_eq!(
            validate_ttl(Duration::ZERO, Duration::from_secs(300), Duration::from_secs(1800))
                .unwrap(),
            Duration::from_secs(300)
        );
    }
}

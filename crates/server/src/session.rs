// Session cache with sliding expiration.
//
// Every successful lookup resets an entry's inactivity clock. A background
// sweeper purges idle entries so eviction notifications fire promptly; a
// lookup that finds an expired entry evicts it on the spot. Either way the
// entry is removed under the write lock, so the hook runs once per entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use chronicle_common::types::UserId;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(20);

const SESSION_KEY_BYTES: usize = 32;

/// Identity proof held for a logged-in caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub user_id: UserId,
    pub user_name: String,
    pub issued_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(user_id: UserId, user_name: impl Into<String>) -> Self {
        Self { user_id, user_name: user_name.into(), issued_at: Utc::now() }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Unknown and timed-out keys are deliberately indistinguishable.
    #[error("session expired or unknown")]
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    Expired,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEviction {
    pub key: String,
    pub token: AuthToken,
    pub cause: EvictionCause,
}

pub type EvictionHook = Arc<dyn Fn(SessionEviction) + Send + Sync>;

#[derive(Debug, Clone)]
struct SessionEntry {
    token: AuthToken,
    last_access: Instant,
}

#[derive(Clone)]
pub struct SessionCache {
    entries: Arc<RwLock<HashMap<String, SessionEntry>>>,
    ttl: Duration,
    on_evict: EvictionHook,
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), ttl, on_evict: Arc::new(log_eviction) }
    }

    pub fn with_eviction_hook(mut self, hook: EvictionHook) -> Self {
        self.on_evict = hook;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace the token for `key` in one step.
    pub async fn put(&self, key: impl Into<String>, token: AuthToken) {
        let entry = SessionEntry { token, last_access: Instant::now() };
        self.entries.write().await.insert(key.into(), entry);
    }

    /// Resolve `key`, resetting its inactivity clock.
    pub async fn get(&self, key: &str) -> Result<AuthToken, SessionError> {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        let Some(entry) = guard.get_mut(key) else {
            return Err(SessionError::Expired);
        };

        if now.duration_since(entry.last_access) < self.ttl {
            entry.last_access = now;
            return Ok(entry.token.clone());
        }

        let evicted = guard.remove(key);
        drop(guard);
        if let Some(entry) = evicted {
            self.notify(key.to_string(), entry.token, EvictionCause::Expired);
        }
        Err(SessionError::Expired)
    }

    /// End a session explicitly. Returns whether it existed.
    pub async fn terminate(&self, key: &str) -> bool {
        let removed = self.entries.write().await.remove(key);
        match removed {
            Some(entry) => {
                self.notify(key.to_string(), entry.token, EvictionCause::Terminated);
                true
            }
            None => false,
        }
    }

    /// Remove every idle entry. Returns how many were evicted.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut guard = self.entries.write().await;
            guard.retain(|key, entry| {
                let alive = now.duration_since(entry.last_access) < self.ttl;
                if !alive {
                    expired.push((key.clone(), entry.token.clone()));
                }
                alive
            });
        }

        let count = expired.len();
        for (key, token) in expired {
            self.notify(key, token, EvictionCause::Expired);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run [`SessionCache::evict_expired`] every `interval` until the
    /// returned handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = cache.evict_expired().await;
                if evicted > 0 {
                    debug!(evicted, "session sweep evicted idle sessions");
                }
            }
        })
    }

    fn notify(&self, key: String, token: AuthToken, cause: EvictionCause) {
        (self.on_evict)(SessionEviction { key, token, cause });
    }
}

fn log_eviction(eviction: SessionEviction) {
    match eviction.cause {
        EvictionCause::Expired => {
            info!(user_id = %eviction.token.user_id, "unregistered session due to inactivity")
        }
        EvictionCause::Terminated => {
            info!(user_id = %eviction.token.user_id, "session terminated")
        }
    }
}

/// A fresh random session key, URL-safe base64 without padding.
pub fn generate_session_key() -> String {
    let mut bytes = [0u8; SESSION_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn token(user: &str) -> AuthToken {
        AuthToken::new(UserId::new(user).expect("valid user"), user.to_uppercase())
    }

    fn recording_cache(ttl: Duration) -> (SessionCache, Arc<Mutex<Vec<SessionEviction>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cache = SessionCache::new(ttl).with_eviction_hook(Arc::new(move |eviction| {
            sink.lock().expect("eviction log lock").push(eviction);
        }));
        (cache, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_ttl_with_single_notification() {
        let (cache, seen) = recording_cache(DEFAULT_SESSION_TTL);
        let sweeper = cache.spawn_sweeper(DEFAULT_SWEEP_INTERVAL);

        cache.put("key-1", token("alice")).await;

        time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(cache.get("key-1").await.expect("still alive").user_id.as_str(), "alice");

        time::sleep(Duration::from_secs(11 * 60)).await;
        assert_eq!(cache.get("key-1").await, Err(SessionError::Expired));

        time::sleep(Duration::from_secs(60)).await;
        sweeper.abort();

        let seen = seen.lock().expect("eviction log lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, "key-1");
        assert_eq!(seen[0].cause, EvictionCause::Expired);
        assert_eq!(seen[0].token.user_id.as_str(), "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_miss_and_expiry_look_the_same() {
        let (cache, seen) = recording_cache(Duration::from_secs(60));
        cache.put("k", token("bob")).await;

        assert_eq!(cache.get("never-issued").await, Err(SessionError::Expired));

        time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k").await, Err(SessionError::Expired));
        assert_eq!(cache.get("k").await, Err(SessionError::Expired));
        assert_eq!(seen.lock().expect("lock").len(), 1, "lazy eviction notifies once");
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_expired_removes_only_idle_entries() {
        let (cache, seen) = recording_cache(Duration::from_secs(60));
        cache.put("idle", token("carol")).await;
        time::advance(Duration::from_secs(40)).await;
        cache.put("fresh", token("dave")).await;
        time::advance(Duration::from_secs(30)).await;

        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.evict_expired().await, 0);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("fresh").await.is_ok());
        assert_eq!(seen.lock().expect("lock")[0].key, "idle");
    }

    #[tokio::test]
    async fn put_replaces_existing_entry() {
        let cache = SessionCache::default();
        cache.put("k", token("alice")).await;
        cache.put("k", token("bob")).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("k").await.expect("present").user_id.as_str(), "bob");
    }

    #[tokio::test]
    async fn concurrent_puts_land_in_their_own_slots() {
        let cache = SessionCache::default();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.put(format!("key-{i}"), token(&format!("user{i}"))).await;
            }));
        }
        for task in tasks {
            task.await.expect("put task");
        }

        for i in 0..32 {
            let resolved = cache.get(&format!("key-{i}")).await.expect("present");
            assert_eq!(resolved.user_id.as_str(), format!("user{i}"));
        }
    }

    #[tokio::test]
    async fn terminate_notifies_with_cause() {
        let (cache, seen) = recording_cache(DEFAULT_SESSION_TTL);
        cache.put("k", token("erin")).await;

        assert!(cache.terminate("k").await);
        assert!(!cache.terminate("k").await);
        assert_eq!(cache.get("k").await, Err(SessionError::Expired));

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].cause, EvictionCause::Terminated);
    }

    #[test]
    fn session_keys_are_random_and_url_safe() {
        let a = generate_session_key();
        let b = generate_session_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}

//! Challenge session storage
//!
//! Sessions live either in process memory (single node) or in Redis (shared
//! between nodes). Both backends expire idle sessions after the configured
//! TTL, which is also what reclaims responses parked for clients that never
//! answer the probe.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fred::clients::Client;
use fred::interfaces::*;
use fred::types::{config::Config as RedisConfig, Expiration};
use std::sync::Arc;
use std::time::Duration;
use tzgate_common::{constants, ChallengeSession};

/// Initialize Redis client
pub async fn init_client(redis_url: &str) -> anyhow::Result<Client> {
    let config = RedisConfig::from_url(redis_url)?;
    let client = Client::new(config, None, None, None);
    client.init().await?;
    Ok(client)
}

/// Session store backends
#[derive(Clone)]
pub enum SessionStore {
    Memory(MemorySessionStore),
    Redis(RedisSessionStore),
    #[cfg(test)]
    Flaky(FlakySessionStore),
}

impl SessionStore {
    /// Load a session, `None` when absent or expired
    pub async fn get(&self, id: &str) -> anyhow::Result<Option<ChallengeSession>> {
        match self {
            SessionStore::Memory(store) => Ok(store.get(id)),
            SessionStore::Redis(store) => store.get(id).await,
            #[cfg(test)]
            SessionStore::Flaky(store) => Ok(store.inner.get(id)),
        }
    }

    /// Write a session, refreshing its TTL
    pub async fn set(&self, id: &str, session: &ChallengeSession) -> anyhow::Result<()> {
        match self {
            SessionStore::Memory(store) => {
                store.set(id, session.clone());
                Ok(())
            }
            SessionStore::Redis(store) => store.set(id, session).await,
            #[cfg(test)]
            SessionStore::Flaky(store) => store.set(id, session),
        }
    }

    /// Remove a session
    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        match self {
            SessionStore::Memory(store) => {
                store.delete(id);
                Ok(())
            }
            SessionStore::Redis(store) => store.delete(id).await,
            #[cfg(test)]
            SessionStore::Flaky(store) => {
                store.inner.delete(id);
                Ok(())
            }
        }
    }

    /// Check that the backend is reachable
    pub async fn ping(&self) -> anyhow::Result<()> {
        match self {
            SessionStore::Memory(_) => Ok(()),
            SessionStore::Redis(store) => store.ping().await,
            #[cfg(test)]
            SessionStore::Flaky(_) => Ok(()),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            SessionStore::Memory(_) => "memory",
            SessionStore::Redis(_) => "redis",
            #[cfg(test)]
            SessionStore::Flaky(_) => "flaky",
        }
    }
}

/// In-process session store
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, (ChallengeSession, DateTime<Utc>)>>,
    ttl: chrono::Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn get(&self, id: &str) -> Option<ChallengeSession> {
        let now = Utc::now();
        let expired = match self.sessions.get(id) {
            Some(entry) => {
                let (session, expires_at) = entry.value();
                if *expires_at > now {
                    return Some(session.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            self.sessions.remove_if(id, |_, (_, expires_at)| *expires_at <= now);
        }
        None
    }

    pub fn set(&self, id: &str, session: ChallengeSession) {
        let expires_at = Utc::now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sessions.insert(id.to_string(), (session, expires_at));
    }

    pub fn delete(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Drop expired sessions (call periodically)
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, (_, expires_at)| *expires_at > now);
        before.saturating_sub(self.sessions.len())
    }
}

/// In-memory store whose writes can be switched to fail
#[cfg(test)]
#[derive(Clone)]
pub struct FlakySessionStore {
    pub inner: MemorySessionStore,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl FlakySessionStore {
    pub fn new(inner: MemorySessionStore) -> Self {
        Self {
            inner,
            fail_writes: Arc::default(),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn set(&self, id: &str, session: &ChallengeSession) -> anyhow::Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("session store is read-only");
        }
        self.inner.set(id, session.clone());
        Ok(())
    }
}

/// Start a task that purges expired in-memory sessions
pub fn spawn_cleanup(
    store: MemorySessionStore,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = store.cleanup();
            if removed > 0 {
                tracing::debug!("Purged {} expired sessions ({} live)", removed, store.len());
            }
        }
    })
}

/// Redis-backed session store
#[derive(Clone)]
pub struct RedisSessionStore {
    client: Client,
    ttl: Duration,
}

impl RedisSessionStore {
    pub fn new(client: Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn key(id: &str) -> String {
        format!("{}{}", constants::SESSION_PREFIX, id)
    }

    /// TTL in whole seconds as sent with `EX`
    fn expire_seconds(&self) -> i64 {
        i64::try_from(self.ttl.as_secs().max(1)).unwrap_or(i64::MAX)
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.client.ping::<()>(None).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<ChallengeSession>> {
        let value: Option<Vec<u8>> = self.client.get(Self::key(id)).await?;

        match value {
            Some(bytes) => Ok(Some(ChallengeSession::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, id: &str, session: &ChallengeSession) -> anyhow::Result<()> {
        let value = session.to_bytes()?;

        self.client
            .set::<(), _, _>(
                Self::key(id),
                value,
                Some(Expiration::EX(self.expire_seconds())),
                None,
                false,
            )
            .await?;

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.client.del::<i64, _>(Self::key(id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(tz: &str) -> ChallengeSession {
        ChallengeSession {
            verified_timezone: Some(tz.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_set_get_delete() {
        let store = SessionStore::Memory(MemorySessionStore::new(Duration::from_secs(60)));

        assert!(store.get("a").await.unwrap().is_none());

        store.set("a", &session("Europe/London")).await.unwrap();
        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.verified_timezone.as_deref(), Some("Europe/London"));

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.backend(), "memory");
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn test_memory_sessions_are_isolated() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.set("a", session("Europe/London"));
        store.set("b", session("Asia/Tokyo"));

        store.delete("a");
        assert!(store.get("a").is_none());
        assert_eq!(
            store.get("b").unwrap().verified_timezone.as_deref(),
            Some("Asia/Tokyo")
        );
    }

    #[test]
    fn test_memory_expiry() {
        let store = MemorySessionStore::new(Duration::ZERO);
        store.set("a", session("Europe/London"));
        assert!(store.get("a").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_memory_cleanup() {
        let expired = MemorySessionStore::new(Duration::ZERO);
        expired.set("a", session("Europe/London"));
        expired.set("b", session("Europe/London"));
        assert_eq!(expired.cleanup(), 2);
        assert_eq!(expired.len(), 0);

        let live = MemorySessionStore::new(Duration::from_secs(60));
        live.set("a", session("Europe/London"));
        assert_eq!(live.cleanup(), 0);
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_redis_key() {
        assert_eq!(RedisSessionStore::key("abc"), "tzgate:session:abc");
    }

    #[test]
    fn test_redis_expire_seconds_are_clamped() {
        let client = Client::new(RedisConfig::default(), None, None, None);
        let store = |ttl| RedisSessionStore::new(client.clone(), ttl);

        assert_eq!(store(Duration::ZERO).expire_seconds(), 1);
        assert_eq!(store(Duration::from_secs(60)).expire_seconds(), 60);
        assert_eq!(store(Duration::from_secs(u64::MAX)).expire_seconds(), i64::MAX);
    }

    #[tokio::test]
    async fn test_flaky_store_fails_writes_only() {
        let flaky = FlakySessionStore::new(MemorySessionStore::new(Duration::from_secs(60)));
        let store = SessionStore::Flaky(flaky.clone());

        store.set("a", &session("Europe/London")).await.unwrap();
        flaky.fail_writes(true);
        assert!(store.set("a", &session("Asia/Tokyo")).await.is_err());
        assert_eq!(
            store.get("a").await.unwrap().unwrap().verified_timezone.as_deref(),
            Some("Europe/London")
        );

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }
}

//! In-process key/value backend.
//!
//! Used for the `local` environment and in tests. Keys expire lazily against
//! the shared [`Clock`](crate::clock::Clock); scripts run their native
//! emulation under the store lock, so they are as atomic as on Redis.
//! Fault injection (`set_unavailable`, `set_latency`) lets tests drive the
//! breaker and the limiter's fail-open path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::kv::{KeyTtl, KvBackend, KvError, KvValue, Script, ScriptEnv};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Unix time at which the entry disappears.
    expires_at: Option<Duration>,
}

/// Keyspace view handed to scripts while the store lock is held.
struct LockedKeyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: Duration,
}

impl LockedKeyspace<'_> {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= self.now
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

impl ScriptEnv for LockedKeyspace<'_> {
    fn get(&mut self, key: &str) -> Option<String> {
        self.live(key).map(|e| e.value.clone())
    }

    fn incr_by(&mut self, key: &str, by: i64) -> Result<i64, KvError> {
        let next = match self.live(key) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| {
                    KvError::Rejected(format!("value at {key} is not an integer"))
                })?;
                let next = current.checked_add(by).ok_or_else(|| {
                    KvError::Rejected("increment or decrement would overflow".to_string())
                })?;
                entry.value = next.to_string();
                next
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: by.to_string(),
                        expires_at: None,
                    },
                );
                by
            }
        };
        Ok(next)
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        let now = self.now;
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }
}

/// A [`KvBackend`] kept in process memory.
#[derive(Debug)]
pub struct MemoryBackend {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
    closed: AtomicBool,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Make every call fail with a backend error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn live_keys(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("memory kv mutex poisoned")
    }

    async fn enter(&self) -> Result<(), KvError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KvError::Closed);
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::Backend("memory backend marked unavailable".into()));
        }
        Ok(())
    }

    fn with_keyspace<T>(&self, f: impl FnOnce(&mut LockedKeyspace<'_>) -> T) -> T {
        let now = self.clock.now();
        let mut entries = self.lock();
        let mut keyspace = LockedKeyspace {
            entries: &mut entries,
            now,
        };
        f(&mut keyspace)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.enter().await?;
        Ok(self.with_keyspace(|ks| ks.get(key)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.enter().await?;
        self.with_keyspace(|ks| {
            let expires_at = ttl.map(|ttl| ks.now + ttl);
            ks.entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at,
                },
            );
        });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, KvError> {
        self.enter().await?;
        Ok(self.with_keyspace(|ks| {
            let existed = ks.live(key).is_some();
            ks.entries.remove(key);
            u64::from(existed)
        }))
    }

    async fn exists(&self, key: &str) -> Result<u64, KvError> {
        self.enter().await?;
        Ok(self.with_keyspace(|ks| u64::from(ks.live(key).is_some())))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        self.enter().await?;
        Ok(self.with_keyspace(|ks| {
            let now = ks.now;
            match ks.live(key) {
                None => KeyTtl::Missing,
                Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => KeyTtl::Expires(at.saturating_sub(now)),
            }
        }))
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<KvValue, KvError> {
        self.enter().await?;
        self.with_keyspace(|ks| script.emulate(ks, keys, args))
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.enter().await
    }

    async fn close(&self) -> Result<(), KvError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn backend() -> (Arc<ManualClock>, MemoryBackend) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        let kv = MemoryBackend::new(clock.clone());
        (clock, kv)
    }

    fn incr_script(
        env: &mut dyn ScriptEnv,
        keys: &[String],
        _args: &[String],
    ) -> Result<KvValue, KvError> {
        let a = env.incr_by(&keys[0], 1)?;
        let b = env.incr_by(&keys[1], 10)?;
        Ok(KvValue::Array(vec![KvValue::Int(a), KvValue::Int(b)]))
    }

    const INCR_BOTH: Script = Script::new(
        "incr_both",
        "return {redis.call('INCR', KEYS[1]), redis.call('INCRBY', KEYS[2], 10)}",
        incr_script,
    );

    #[tokio::test]
    async fn test_keys_expire_against_clock() {
        let (clock, kv) = backend();
        kv.set("a", "1", Some(Duration::from_secs(2))).await.unwrap();
        kv.set("b", "2", None).await.unwrap();

        assert_eq!(kv.ttl("a").await.unwrap(), KeyTtl::Expires(Duration::from_secs(2)));
        assert_eq!(kv.ttl("b").await.unwrap(), KeyTtl::Persistent);

        clock.advance(Duration::from_secs(2));
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.ttl("a").await.unwrap(), KeyTtl::Missing);
        assert_eq!(kv.get("b").await.unwrap(), Some("2".to_string()));
        assert_eq!(kv.live_keys(), 1);
    }

    #[tokio::test]
    async fn test_eval_runs_emulation() {
        let (_, kv) = backend();
        let keys = vec!["x".to_string(), "y".to_string()];
        kv.eval(&INCR_BOTH, &keys, &[]).await.unwrap();
        let reply = kv.eval(&INCR_BOTH, &keys, &[]).await.unwrap();
        assert_eq!(reply, KvValue::Array(vec![KvValue::Int(2), KvValue::Int(20)]));

        kv.set("x", "nope", None).await.unwrap();
        let err = kv.eval(&INCR_BOTH, &keys, &[]).await.unwrap_err();
        assert!(matches!(err, KvError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_increment_overflow_is_rejected() {
        let (_, kv) = backend();
        let keys = vec!["x".to_string(), "y".to_string()];
        kv.set("x", &i64::MAX.to_string(), None).await.unwrap();

        let err = kv.eval(&INCR_BOTH, &keys, &[]).await.unwrap_err();
        assert!(matches!(err, KvError::Rejected(_)));
        assert_eq!(kv.get("x").await.unwrap(), Some(i64::MAX.to_string()));
    }

    #[tokio::test]
    async fn test_fault_injection_and_close() {
        let (_, kv) = backend();
        kv.set_unavailable(true);
        assert!(matches!(kv.ping().await, Err(KvError::Backend(_))));
        kv.set_unavailable(false);
        assert!(kv.ping().await.is_ok());

        kv.close().await.unwrap();
        assert_eq!(kv.get("a").await, Err(KvError::Closed));
    }

    #[tokio::test]
    async fn test_del_and_exists() {
        let (_, kv) = backend();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.exists("k").await.unwrap(), 1);
        assert_eq!(kv.del("k").await.unwrap(), 1);
        assert_eq!(kv.del("k").await.unwrap(), 0);
        assert_eq!(kv.exists("k").await.unwrap(), 0);
    }
}

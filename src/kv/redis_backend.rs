//! Redis backend over a `deadpool-redis` connection pool.
//!
//! # Responsibilities
//! - Own the one connection pool for the process (built at startup)
//! - Bound every command by the read timeout
//! - Classify failures: I/O, pool and connection problems are backend
//!   faults; protocol replies (wrong type, script errors) are rejections
//! - Reap idle connections on a fixed cadence until shutdown

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{
    Config as PoolConfig, Connection, Pool, PoolConfig as PoolSizing, Runtime, Timeouts,
};
use tokio::sync::broadcast;

use crate::config::KvConfig;
use crate::kv::{KeyTtl, KvBackend, KvError, KvValue, Script};

/// A [`KvBackend`] talking to a Redis server.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    addr: Arc<str>,
    read_timeout: Duration,
    idle_timeout: Duration,
    /// Compiled scripts by name; `redis::Script` caches the SHA and falls back
    /// to `EVAL` on `NOSCRIPT`.
    scripts: Arc<DashMap<&'static str, redis::Script>>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("addr", &self.addr)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Build the pool described by `config`. No connection is opened yet.
    pub fn new(config: &KvConfig) -> Result<Self, KvError> {
        let url = if config.addr.contains("://") {
            config.addr.clone()
        } else {
            format!("redis://{}", config.addr)
        };

        let mut timeouts = Timeouts::new();
        timeouts.wait = Some(Duration::from_millis(config.dial_timeout_ms));
        timeouts.create = Some(Duration::from_millis(config.dial_timeout_ms));
        timeouts.recycle = Some(Duration::from_millis(config.read_timeout_ms));

        let mut sizing = PoolSizing::new(config.pool_size);
        sizing.timeouts = timeouts;

        let mut pool_config = PoolConfig::from_url(url);
        pool_config.pool = Some(sizing);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| KvError::Backend(format!("failed to create redis pool: {e}")))?;

        Ok(Self {
            pool,
            addr: config.addr.as_str().into(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            scripts: Arc::new(DashMap::new()),
        })
    }

    /// Build the pool and verify the server answers.
    pub async fn connect(config: &KvConfig) -> Result<Self, KvError> {
        let backend = Self::new(config)?;
        backend.ping().await?;
        tracing::info!(addr = %backend.addr, pool_size = config.pool_size, "Connected to redis");
        Ok(backend)
    }

    /// Close connections idle for longer than the idle timeout every `every`,
    /// until `shutdown` fires.
    pub fn spawn_idle_reaper(
        &self,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("Idle connection reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool.retain(|_, metrics| metrics.last_used() < idle_timeout);
                        tracing::trace!(
                            pooled = pool.status().size,
                            "Reaped idle redis connections"
                        );
                    }
                }
            }
        })
    }

    async fn conn(&self) -> Result<Connection, KvError> {
        if self.pool.is_closed() {
            return Err(KvError::Closed);
        }
        self.pool
            .get()
            .await
            .map_err(|e| KvError::Backend(format!("redis pool: {e}")))
    }

    /// Run one command under the read timeout.
    async fn exec<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, KvError> {
        let mut conn = self.conn().await?;
        match tokio::time::timeout(self.read_timeout, cmd.query_async(&mut conn)).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(KvError::Timeout(self.read_timeout)),
        }
    }

    fn compiled(&self, script: &Script) -> redis::Script {
        self.scripts
            .entry(script.name())
            .or_insert_with(|| redis::Script::new(script.source()))
            .clone()
    }
}

/// Map a redis error onto the breaker's fault classes.
fn classify(err: redis::RedisError) -> KvError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        KvError::Backend(err.to_string())
    } else {
        KvError::Rejected(err.to_string())
    }
}

fn to_kv_value(value: redis::Value) -> KvValue {
    match value {
        redis::Value::Nil => KvValue::Nil,
        redis::Value::Int(i) => KvValue::Int(i),
        redis::Value::BulkString(bytes) => {
            KvValue::Str(String::from_utf8_lossy(&bytes).into_owned())
        }
        redis::Value::SimpleString(s) => KvValue::Str(s),
        redis::Value::Okay => KvValue::Str("OK".to_string()),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            KvValue::Array(items.into_iter().map(to_kv_value).collect())
        }
        redis::Value::Boolean(b) => KvValue::Int(i64::from(b)),
        redis::Value::Double(d) => KvValue::Str(d.to_string()),
        other => KvValue::Str(format!("{other:?}")),
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.exec(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = self.exec(cmd).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, KvError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.exec(cmd).await
    }

    async fn exists(&self, key: &str) -> Result<u64, KvError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.exec(cmd).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let millis: i64 = self.exec(cmd).await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<KvValue, KvError> {
        let compiled = self.compiled(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.conn().await?;
        let reply =
            tokio::time::timeout(self.read_timeout, invocation.invoke_async(&mut conn)).await;
        let value: redis::Value = match reply {
            Ok(result) => result.map_err(classify)?,
            Err(_) => return Err(KvError::Timeout(self.read_timeout)),
        };
        Ok(to_kv_value(value))
    }

    async fn ping(&self) -> Result<(), KvError> {
        let pong: String = self.exec(redis::cmd("PING")).await?;
        tracing::trace!(reply = %pong, "redis ping");
        Ok(())
    }

    async fn close(&self) -> Result<(), KvError> {
        self.pool.close();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("redis://{}", self.addr.trim_start_matches("redis://"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_conversion() {
        let reply = redis::Value::Array(vec![
            redis::Value::Int(3),
            redis::Value::BulkString(b"1".to_vec()),
            redis::Value::Nil,
        ]);
        assert_eq!(
            to_kv_value(reply),
            KvValue::Array(vec![KvValue::Int(3), KvValue::Str("1".into()), KvValue::Nil])
        );
    }

    #[test]
    fn test_response_errors_are_rejections() {
        let err = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(classify(err), KvError::Rejected(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(matches!(classify(redis::RedisError::from(io)), KvError::Backend(_)));
    }

    #[tokio::test]
    async fn test_pool_builds_without_connecting() {
        let config = KvConfig {
            addr: "127.0.0.1:1".to_string(),
            ..KvConfig::default()
        };
        let backend = RedisBackend::new(&config).unwrap();
        assert_eq!(backend.describe(), "redis://127.0.0.1:1");
    }
}

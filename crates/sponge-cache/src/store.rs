use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("cache store lock poisoned")]
    LockPoisoned,
}

/// The shared key-value store behind the proxy.
///
/// `get` distinguishes an absent key (`Ok(None)`) from a transport or store
/// failure (`Err`); callers degrade both the error case and the miss case to
/// an origin fetch, and log-and-drop `set` failures.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// A zero `ttl` stores the entry without expiration.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCacheConfig {
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
        }
    }
}

/// Redis-backed store used in production deployments.
///
/// Construction never touches the network; the connection is established on
/// first use and re-established after it is lost. An unreachable backend
/// therefore degrades every lookup to a miss instead of keeping the proxy
/// from starting.
pub struct RedisCacheStore {
    client: redis::Client,
    connection: Arc<tokio::sync::Mutex<Option<ConnectionManager>>>,
}

impl RedisCacheStore {
    pub fn new(config: &RedisCacheConfig) -> Result<Self, CacheError> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(config.hostname.clone(), config.port),
            redis: redis::RedisConnectionInfo {
                db: config.db,
                username: config.username.clone(),
                password: config.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        Ok(Self {
            client,
            connection: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let mut slot = self.connection.lock().await;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }
        let manager = self.client.get_connection_manager().await?;
        *slot = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value).await?;
        } else {
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        }
        Ok(())
    }
}

/// In-process store for tests and single-node experiments. Entries never
/// expire; the TTL is accepted and ignored.
#[derive(Debug, Default, Clone)]
pub struct MemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

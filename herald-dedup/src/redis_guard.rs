use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use herald_models::IdempotencyKey;
use log::{debug, info, warn};
use parking_lot::Mutex;
use redis::{aio::MultiplexedConnection, Client, Script};
use uuid::Uuid;

use crate::{DedupError, DedupGuard};

pub const DEFAULT_KEY_PREFIX: &str = "herald:dedup:";

// Deletes the key only while it still holds this guard's token.
const RELEASE_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// Guard shared by every worker process pointing at the same Redis.
///
/// `acquire` is `SET key <token> NX EX ttl`, so a key left behind by a crashed
/// worker expires after `ttl` instead of blocking its session forever. Each
/// acquire writes a fresh token, and `release` deletes the key only if that token
/// is still there. A lease that expired and was taken by another worker is left
/// alone. The TTL must be longer than any single delivery attempt.
pub struct RedisDedupGuard {
    connection: MultiplexedConnection,
    prefix: String,
    ttl: Duration,
    tokens: Mutex<HashMap<String, String>>,
}

impl RedisDedupGuard {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, DedupError> {
        Self::connect_with_prefix(url, ttl, DEFAULT_KEY_PREFIX).await
    }

    pub async fn connect_with_prefix(
        url: &str,
        ttl: Duration,
        prefix: &str,
    ) -> Result<Self, DedupError> {
        if ttl.as_secs() == 0 {
            return Err(DedupError::Config(
                "ttl must be at least one second".to_string(),
            ));
        }

        let client = Client::open(url).map_err(|err| DedupError::Unavailable(err.to_string()))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| DedupError::Unavailable(err.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|err| DedupError::Unavailable(err.to_string()))?;

        info!("Connected to Redis dedup store (ttl {}s)", ttl.as_secs());
        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            ttl,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn storage_key(&self, key: &IdempotencyKey) -> String {
        storage_key(&self.prefix, key)
    }
}

fn storage_key(prefix: &str, key: &IdempotencyKey) -> String {
    format!("{}{}", prefix, key.as_str())
}

fn command_error(key: &str, err: redis::RedisError) -> DedupError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        DedupError::Unavailable(err.to_string())
    } else {
        DedupError::Command {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl DedupGuard for RedisDedupGuard {
    async fn acquire(&self, key: &IdempotencyKey) -> Result<bool, DedupError> {
        let storage_key = self.storage_key(key);
        let token = Uuid::new_v4().to_string();
        let mut connection = self.connection.clone();

        // SET NX replies nil when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&storage_key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut connection)
            .await
            .map_err(|err| command_error(&storage_key, err))?;

        let acquired = reply.is_some();
        if acquired {
            self.tokens.lock().insert(storage_key.clone(), token);
        }
        debug!("Dedup acquire '{}': {}", storage_key, acquired);
        Ok(acquired)
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<(), DedupError> {
        let storage_key = self.storage_key(key);
        let Some(token) = self.tokens.lock().remove(&storage_key) else {
            debug!("Dedup release '{}': not held here", storage_key);
            return Ok(());
        };
        let mut connection = self.connection.clone();

        let removed: i64 = Script::new(RELEASE_SCRIPT)
            .key(&storage_key)
            .arg(&token)
            .invoke_async(&mut connection)
            .await
            .map_err(|err| command_error(&storage_key, err))?;

        if removed == 0 {
            warn!(
                "Dedup lease on '{}' expired before release; left untouched",
                storage_key
            );
        } else {
            debug!("Dedup release '{}'", storage_key);
        }
        Ok(())
    }
}

//! Redis-backed counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use tracing::{info, warn};

use super::CounterStore;
use crate::error::Result;

/// Creates the counter if needed, adds the amount and maintains both the
/// TTL and the sibling `<key>/expires` timestamp (milliseconds) in one
/// atomic step.
///
/// KEYS[1] counter, KEYS[2] expiry timestamp
/// ARGV[1] amount, ARGV[2] ttl in ms, ARGV[3] now in ms, ARGV[4] elastic flag
const INCR_SCRIPT: &str = r#"
local fresh = redis.call('EXISTS', KEYS[1]) == 0
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if fresh or ARGV[4] == '1' then
    local ttl = tonumber(ARGV[2])
    if ttl > 0 then
        redis.call('PEXPIRE', KEYS[1], ttl)
        redis.call('SET', KEYS[2], tonumber(ARGV[3]) + ttl, 'PX', ttl)
    else
        redis.call('DEL', KEYS[1], KEYS[2])
    end
end
return value
"#;

/// A counter store on a single Redis node.
///
/// The connection manager reconnects transparently; any error it reports is
/// surfaced as `StoreUnavailable`.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    incr_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to Redis counter store");

        let client = Client::open(url)?;
        let connection = client.get_connection_manager().await?;

        Ok(Self {
            connection,
            incr_script: Script::new(INCR_SCRIPT),
        })
    }

    fn expiry_key(key: &str) -> String {
        format!("{}/expires", key)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<i64> {
        let mut connection = self.connection.clone();
        let value: Option<i64> = connection.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn incr(&self, key: &str, expiry: i64, elastic: bool, amount: i64) -> Result<i64> {
        let mut connection = self.connection.clone();
        let ttl_ms = expiry.saturating_mul(1000);
        let now_ms = Utc::now().timestamp_millis();

        let value: i64 = self
            .incr_script
            .key(key)
            .key(Self::expiry_key(key))
            .arg(amount)
            .arg(ttl_ms)
            .arg(now_ms)
            .arg(if elastic { "1" } else { "0" })
            .invoke_async(&mut connection)
            .await?;
        Ok(value)
    }

    async fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>> {
        let mut connection = self.connection.clone();
        let expires_ms: Option<i64> = connection.get(Self::expiry_key(key)).await?;
        let now = Utc::now();
        Ok(expires_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(now))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .del(vec![key.to_string(), Self::expiry_key(key)])
            .await?;
        Ok(())
    }

    async fn check(&self) -> bool {
        let mut connection = self.connection.clone();
        let pong: std::result::Result<String, _> =
            ::redis::cmd("PING").query_async(&mut connection).await;
        match pong {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Redis liveness check failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

//! Redis connections for the store.

use anyhow::Context;
use redis::Client;
use redis::aio::ConnectionManager;

use crate::store::RedisStore;

/// Open the two managed connections a [`RedisStore`] needs: one shared by
/// plain commands and one reserved for the blocking event pop, so a `BRPOP`
/// waiting on an empty queue never stalls trigger or contact lookups.
pub async fn connect_store(redis_url: &str) -> anyhow::Result<RedisStore> {
    let client = Client::open(redis_url).context("Invalid REDIS_URL")?;
    let info = client.get_connection_info();
    let addr = info.addr.to_string();
    let db = info.redis.db;

    let conn = ConnectionManager::new(client.clone())
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", addr))?;
    let blocking_conn = ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to open blocking connection to Redis at {}", addr))?;

    tracing::info!(addr = %addr, db, "Connected to Redis");
    Ok(RedisStore::new(conn, blocking_conn))
}

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Handle to the key/value cache.
///
/// Cloning is cheap — the connection manager multiplexes one connection and
/// clones share it.
#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }

    /// Fetch a string value; `None` when the key is absent.
    pub async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }

    /// Store a string value with an expiry in seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await
    }

    /// Delete every key matching `pattern`, returning how many were removed.
    ///
    /// Driven by cursor-paged SCAN so the keyspace may mutate mid-scan; a key
    /// that vanished between SCAN and DEL simply counts as zero deletions.
    pub async fn delete_matching(&self, pattern: &str) -> redis::RedisResult<u64> {
        let mut conn = self.conn.clone();
        let mut deleted: u64 = 0;
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for key in &keys {
                let n: u64 = conn.del(key).await?;
                deleted += n;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }
}

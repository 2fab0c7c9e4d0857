//! Redis-backed lease lock (distributed mutual exclusion).
//!
//! Acquisition is a single `SET key token NX PX ttl` so two concurrent
//! callers can never both succeed; release checks the token server-side
//! before deleting, so an expired-and-reacquired lease is never released by
//! its previous holder.

use std::sync::Arc;
use std::time::Duration;

use super::{LeaseLock, LeaseToken, LockError};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLeaseLock {
    client: Arc<redis::Client>,
}

impl RedisLeaseLock {
    /// Create a lease lock against the given Redis URL
    /// (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Connection(e.to_string()))
    }
}

impl LeaseLock for RedisLeaseLock {
    fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError> {
        let mut conn = self.connection()?;
        let token = LeaseToken(uuid::Uuid::now_v7().to_string());

        // SET NX PX replies OK when the key was free, nil when it was held.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query(&mut conn)
            .map_err(|e| LockError::Command(e.to_string()))?;

        Ok(reply.map(|_| token))
    }

    fn release(&self, key: &str, token: &LeaseToken) -> Result<(), LockError> {
        let mut conn = self.connection()?;

        let _deleted: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(token.as_str())
            .query(&mut conn)
            .map_err(|e| LockError::Command(e.to_string()))?;

        Ok(())
    }
}

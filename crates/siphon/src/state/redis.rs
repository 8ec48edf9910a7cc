//! Remote-cache watermark backend.
//!
//! The whole record lives in a single key, `<prefix>:state`, with no TTL,
//! so a replacement instance (possibly on another host) resumes from the
//! shared watermark. Reachability is verified at construction; a backend
//! that cannot be reached at startup makes the supervisor fall back to
//! the local file. Mid-run connection loss is not a fallback: the store
//! stays dirty and the next periodic flush retries.

use redis::AsyncCommands;

use super::{State, StateBackend, StateError};
use crate::config::RedisConfig;

pub struct RedisBackend {
    client: redis::Client,
    key: String,
}

impl RedisBackend {
    /// Opens a client and pings the server once, proving reachability
    /// before the backend is selected.
    pub async fn connect(config: &RedisConfig) -> Result<RedisBackend, StateError> {
        let client = redis::Client::open(config.url().as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        Ok(RedisBackend {
            client,
            key: format!("{}:state", config.key_prefix),
        })
    }
}

#[async_trait::async_trait]
impl StateBackend for RedisBackend {
    async fn load(&self) -> Result<Option<State>, StateError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let data: Option<String> = conn.get(&self.key).await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, state: &State) -> Result<(), StateError> {
        let data = serde_json::to_string(state)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(&self.key, data).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

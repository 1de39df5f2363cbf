//! A Redis-backed [`LivenessStorage`].
//!
//! # Redis data model
//!
//! ```text
//! {
//!     // Liveness snapshots, one string per device with a TTL of
//!     // miss_threshold * heartbeat_interval
//!     "live:{device_id}": "{\"seq\":7,\"received_at\":...,\"metrics\":{...}}",
//!
//!     // Pending commands, one list per device, bounded to 32 entries
//!     "cmdq:{device_id}": [ "{\"type\":\"start_training\",...}", ... ]
//! }
//! ```
//!
//! Sharing this keyspace across orchestrator replicas is what makes liveness
//! a fleet-wide property rather than a per-process one.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, IntoConnectionInfo, Script};
pub use redis::{RedisError, RedisResult};

use edgeorchestra_core::{Command, DeviceId};

use crate::{
    liveness::HeartbeatSnapshot,
    storage::{HeartbeatUpsert, LivenessStorage, StaleSequence, StorageError, StorageResult},
};

#[derive(Clone)]
pub struct Client {
    connection: ConnectionManager,
}

fn to_storage_err(e: RedisError) -> StorageError {
    anyhow::anyhow!(e)
}

fn live_key(id: &DeviceId) -> String {
    format!("live:{}", id)
}

fn cmdq_key(id: &DeviceId) -> String {
    format!("cmdq:{}", id)
}

impl Client {
    /// Creates a new Redis client.
    ///
    /// `url` to which Redis instance the client should connect to.
    /// The URL format is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// The [`Client`] uses a [`redis::aio::ConnectionManager`] that
    /// automatically reconnects if the connection is dropped.
    pub async fn new<T: IntoConnectionInfo>(url: T) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_tokio_connection_manager().await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl LivenessStorage for Client {
    /// See [`LivenessStorage::upsert_heartbeat`].
    async fn upsert_heartbeat(
        &mut self,
        id: &DeviceId,
        snapshot: &HeartbeatSnapshot,
        ttl: Duration,
    ) -> StorageResult<HeartbeatUpsert> {
        let script = Script::new(
            r#"
                local stored = redis.call("GET", KEYS[1])
                if stored then
                    local prev = cjson.decode(stored)
                    if tonumber(ARGV[2]) <= tonumber(prev["seq"]) then
                        -- stale: report the stored sequence back
                        return tonumber(prev["seq"])
                    end
                end
                redis.call("SET", KEYS[1], ARGV[1], "EX", ARGV[3])
                return -1
            "#,
        );
        let payload = serde_json::to_string(snapshot).map_err(StorageError::from)?;
        let stored: i64 = script
            .key(live_key(id))
            .arg(payload)
            .arg(snapshot.seq)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut self.connection)
            .await
            .map_err(to_storage_err)?;
        if stored >= 0 {
            Ok(HeartbeatUpsert(Err(StaleSequence {
                stored: stored as u64,
                received: snapshot.seq,
            })))
        } else {
            Ok(HeartbeatUpsert(Ok(())))
        }
    }

    /// See [`LivenessStorage::heartbeat`].
    async fn heartbeat(&mut self, id: &DeviceId) -> StorageResult<Option<HeartbeatSnapshot>> {
        // https://redis.io/commands/get
        // > Bulk string reply: the value of key, or nil when key does not exist.
        let raw: Option<String> = self
            .connection
            .get(live_key(id))
            .await
            .map_err(to_storage_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    /// See [`LivenessStorage::remove_heartbeat`].
    async fn remove_heartbeat(&mut self, id: &DeviceId) -> StorageResult<()> {
        // https://redis.io/commands/del
        // Returns the number of keys removed; we are not interested in it.
        let _: i64 = self
            .connection
            .del(live_key(id))
            .await
            .map_err(to_storage_err)?;
        Ok(())
    }

    /// See [`LivenessStorage::push_command`].
    async fn push_command(
        &mut self,
        id: &DeviceId,
        command: &Command,
        cap: usize,
    ) -> StorageResult<Option<Command>> {
        let script = Script::new(
            r#"
                redis.call("RPUSH", KEYS[1], ARGV[1])
                if redis.call("LLEN", KEYS[1]) <= tonumber(ARGV[2]) then
                    return nil
                end
                -- over capacity: drop the oldest non-durable entry
                local entries = redis.call("LRANGE", KEYS[1], 0, -1)
                for _, entry in ipairs(entries) do
                    local cmd = cjson.decode(entry)
                    if cmd["type"] ~= "shutdown" then
                        redis.call("LREM", KEYS[1], 1, entry)
                        return entry
                    end
                end
                return nil
            "#,
        );
        let payload = serde_json::to_string(command).map_err(StorageError::from)?;
        let dropped: Option<String> = script
            .key(cmdq_key(id))
            .arg(payload)
            .arg(cap)
            .invoke_async(&mut self.connection)
            .await
            .map_err(to_storage_err)?;
        dropped
            .map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    /// See [`LivenessStorage::pop_command`].
    async fn pop_command(&mut self, id: &DeviceId) -> StorageResult<Option<Command>> {
        // https://redis.io/commands/lpop
        // > Bulk string reply: the value of the first element, or nil when
        //   key does not exist.
        let raw: Option<String> = self
            .connection
            .lpop(cmdq_key(id))
            .await
            .map_err(to_storage_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }
}

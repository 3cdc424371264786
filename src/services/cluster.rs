/**
 * REQUIREMENT: Shared-state store plus pub/sub fan-out so many server instances
 * form one logical room
 * PURPOSE: Key-value mirroring, distributed locks, and cross-node broadcast
 * Key namespaces: room:, user:, presence:, message:, metrics:, session:, lock:
 */
use futures_util::StreamExt;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::{CollabError, CollabResult};
use crate::models::message::QueuedMessage;
use crate::models::presence::PresenceRecord;
use crate::models::room::Room;
use crate::services::resilience::CircuitBreaker;

const ROOM_TTL_SECS: u64 = 60 * 60;
const PRESENCE_TTL_SECS: u64 = 5 * 60;
const SESSION_TTL_SECS: u64 = 60 * 60;
const METRICS_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Adapter call budget; no cluster call runs without this caller-side timeout
const ADAPTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Health snapshot surfaced on /health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub connected: bool,
    pub reconnect_attempts: u32,
}

/// Release handle returned by `acquire_lock`; the nonce guards against
/// releasing a lock that expired and was re-acquired elsewhere
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub resource: String,
    nonce: String,
}

/// A message received over the pub/sub backplane
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    /// Second segment of the channel name, e.g. `websocket:room:update` -> `room`
    pub category: String,
    pub payload: Value,
}

impl ChannelMessage {
    pub fn category_of(channel: &str) -> String {
        channel.split(':').nth(1).unwrap_or("").to_string()
    }
}

pub type MessageHandler = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

pub struct ClusterAdapter {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
    max_reconnect_attempts: u32,
    breaker: CircuitBreaker,
}

impl ClusterAdapter {
    /// Connect to the cluster store with exponential backoff
    pub async fn connect(url: &str, max_reconnect_attempts: u32) -> CollabResult<Arc<Self>> {
        let client = redis::Client::open(url)
            .map_err(|e| CollabError::Config(format!("invalid cluster url: {}", e)))?;

        let adapter = Arc::new(Self {
            client,
            conn: RwLock::new(None),
            connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            max_reconnect_attempts,
            breaker: CircuitBreaker::with_defaults("cluster-store"),
        });
        adapter.reconnect().await?;
        Ok(adapter)
    }

    /// (Re-)establish the managed connection, backing off between attempts
    pub async fn reconnect(&self) -> CollabResult<()> {
        let mut delay = Duration::from_millis(250);
        for attempt in 0..self.max_reconnect_attempts {
            match self.client.get_connection_manager().await {
                Ok(manager) => {
                    *self.conn.write().await = Some(manager);
                    self.connected.store(true, Ordering::SeqCst);
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    info!("cluster store connected");
                    return Ok(());
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    self.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);
                    warn!(
                        "cluster store connection attempt {}/{} failed: {}",
                        attempt + 1,
                        self.max_reconnect_attempts,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
        Err(CollabError::ClusterUnavailable(format!(
            "gave up after {} attempts",
            self.max_reconnect_attempts
        )))
    }

    async fn connection(&self) -> CollabResult<ConnectionManager> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| CollabError::ClusterUnavailable("not connected".to_string()))
    }

    /// Health probe: PING round-trip latency plus connection counters
    pub async fn health(&self) -> ClusterHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if !connected {
            return ClusterHealth {
                status: "disconnected".to_string(),
                latency_ms: None,
                connected: false,
                reconnect_attempts: attempts,
            };
        }
        let started = Instant::now();
        let ping: CollabResult<String> = async {
            let mut conn = self.connection().await?;
            Ok(redis::cmd("PING").query_async(&mut conn).await?)
        }
        .await;
        match ping {
            Ok(_) => ClusterHealth {
                status: "healthy".to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
                connected: true,
                reconnect_attempts: attempts,
            },
            Err(_) => ClusterHealth {
                status: "degraded".to_string(),
                latency_ms: None,
                connected: false,
                reconnect_attempts: attempts,
            },
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> CollabResult<()> {
        let payload = serde_json::to_string(value)?;
        let key = key.to_string();
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&payload)
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> CollabResult<Option<T>> {
        let key = key.to_string();
        let mut conn = self.connection().await?;
        let raw: Option<String> = self
            .breaker
            .call(ADAPTER_TIMEOUT, async move {
                Ok(conn.get(key).await?)
            })
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    async fn delete_key(&self, key: &str) -> CollabResult<()> {
        let key = key.to_string();
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                conn.del::<_, ()>(key).await?;
                Ok(())
            })
            .await
    }

    // --- rooms ---

    pub async fn set_room(&self, room: &Room) -> CollabResult<()> {
        self.set_json(&format!("room:{}", room.id), room, ROOM_TTL_SECS)
            .await
    }

    pub async fn get_room(&self, room_id: &str) -> CollabResult<Option<Room>> {
        self.get_json(&format!("room:{}", room_id)).await
    }

    pub async fn delete_room(&self, room_id: &str) -> CollabResult<()> {
        self.delete_key(&format!("room:{}", room_id)).await?;
        self.delete_key(&format!("room:{}:users", room_id)).await
    }

    pub async fn add_user_to_room(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        let key = format!("room:{}:users", room_id);
        let user = user_id.to_string();
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                conn.sadd::<_, _, ()>(&key, user).await?;
                redis::cmd("EXPIRE")
                    .arg(&key)
                    .arg(ROOM_TTL_SECS)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            })
            .await
    }

    pub async fn remove_user_from_room(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        let key = format!("room:{}:users", room_id);
        let user = user_id.to_string();
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                conn.srem::<_, _, ()>(key, user).await?;
                Ok(())
            })
            .await
    }

    pub async fn room_users(&self, room_id: &str) -> CollabResult<Vec<String>> {
        let key = format!("room:{}:users", room_id);
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                Ok(conn.smembers(key).await?)
            })
            .await
    }

    // --- presence ---

    pub async fn set_presence(
        &self,
        room_id: &str,
        user_id: &str,
        record: &PresenceRecord,
    ) -> CollabResult<()> {
        self.set_json(
            &format!("presence:{}:{}", room_id, user_id),
            record,
            PRESENCE_TTL_SECS,
        )
        .await
    }

    pub async fn get_presence(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> CollabResult<Option<PresenceRecord>> {
        self.get_json(&format!("presence:{}:{}", room_id, user_id))
            .await
    }

    pub async fn get_room_presence(&self, room_id: &str) -> CollabResult<Vec<PresenceRecord>> {
        let pattern = format!("presence:{}:*", room_id);
        let mut conn = self.connection().await?;
        let keys: Vec<String> = self
            .breaker
            .call(ADAPTER_TIMEOUT, async move {
                Ok(conn.keys(pattern).await?)
            })
            .await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.get_json::<PresenceRecord>(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn delete_presence(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        self.delete_key(&format!("presence:{}:{}", room_id, user_id))
            .await
    }

    // --- queued messages ---

    pub async fn queue_message(&self, owner_key: &str, message: &QueuedMessage) -> CollabResult<()> {
        let key = format!("message:{}", owner_key);
        let payload = serde_json::to_string(message)?;
        let ttl = (message.expires_at - chrono::Utc::now())
            .num_seconds()
            .max(1) as i64;
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                conn.rpush::<_, _, ()>(&key, payload).await?;
                redis::cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            })
            .await
    }

    pub async fn get_queued_messages(&self, owner_key: &str) -> CollabResult<Vec<QueuedMessage>> {
        let key = format!("message:{}", owner_key);
        let mut conn = self.connection().await?;
        let raw: Vec<String> = self
            .breaker
            .call(ADAPTER_TIMEOUT, async move {
                Ok(conn.lrange(key, 0, -1).await?)
            })
            .await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }

    pub async fn clear_queued_messages(&self, owner_key: &str) -> CollabResult<()> {
        self.delete_key(&format!("message:{}", owner_key)).await
    }

    // --- sessions ---

    pub async fn set_session(&self, session_id: &str, payload: &Value) -> CollabResult<()> {
        self.set_json(&format!("session:{}", session_id), payload, SESSION_TTL_SECS)
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> CollabResult<Option<Value>> {
        self.get_json(&format!("session:{}", session_id)).await
    }

    // --- metrics ---

    pub async fn increment_metric(&self, name: &str, by: i64) -> CollabResult<()> {
        let name = name.to_string();
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                conn.hincr::<_, _, _, ()>("metrics:websocket", name, by).await?;
                redis::cmd("EXPIRE")
                    .arg("metrics:websocket")
                    .arg(METRICS_TTL_SECS)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            })
            .await
    }

    pub async fn get_metrics(&self) -> CollabResult<HashMap<String, i64>> {
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                Ok(conn.hgetall("metrics:websocket").await?)
            })
            .await
    }

    // --- locks ---

    /// Atomic set-if-absent with TTL; the handle carries a per-acquisition nonce
    pub async fn acquire_lock(&self, resource: &str, ttl: Duration) -> CollabResult<Option<LockHandle>> {
        let key = format!("lock:{}", resource);
        let nonce: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let nonce_for_cmd = nonce.clone();
        let mut conn = self.connection().await?;
        let acquired: Option<String> = self
            .breaker
            .call(ADAPTER_TIMEOUT, async move {
                Ok(redis::cmd("SET")
                    .arg(&key)
                    .arg(&nonce_for_cmd)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?)
            })
            .await?;
        Ok(acquired.map(|_| LockHandle {
            resource: resource.to_string(),
            nonce,
        }))
    }

    /// Atomic compare-nonce-and-delete; no-op when the stored nonce differs
    pub async fn release_lock(&self, handle: &LockHandle) -> CollabResult<bool> {
        let script = redis::Script::new(
            r#"
            if redis.call('get', KEYS[1]) == ARGV[1] then
                return redis.call('del', KEYS[1])
            else
                return 0
            end
            "#,
        );
        let key = format!("lock:{}", handle.resource);
        let nonce = handle.nonce.clone();
        let mut conn = self.connection().await?;
        let released: i64 = self
            .breaker
            .call(ADAPTER_TIMEOUT, async move {
                Ok(script.key(key).arg(nonce).invoke_async(&mut conn).await?)
            })
            .await?;
        Ok(released == 1)
    }

    // --- pub/sub ---

    /// Publish a JSON payload on a channel
    pub async fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> CollabResult<()> {
        let body = serde_json::to_string(payload)?;
        let channel = channel.to_string();
        let mut conn = self.connection().await?;
        self.breaker
            .call(ADAPTER_TIMEOUT, async move {
                conn.publish::<_, _, ()>(channel, body).await?;
                Ok(())
            })
            .await
    }

    /// Pattern subscription; the handler runs for every matched message.
    /// The receive loop reconnects with backoff when the connection drops.
    pub async fn subscribe(self: &Arc<Self>, pattern: &str, handler: MessageHandler) -> CollabResult<()> {
        let pattern = pattern.to_string();
        let client = self.client.clone();
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(250);
            loop {
                let pubsub = match client.get_async_connection().await {
                    Ok(conn) => conn.into_pubsub(),
                    Err(e) => {
                        error!("pub/sub connection failed: {}", e);
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(30));
                        continue;
                    }
                };
                let mut pubsub = pubsub;
                if let Err(e) = pubsub.psubscribe(&pattern).await {
                    error!("psubscribe {} failed: {}", pattern, e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                    continue;
                }
                delay = Duration::from_millis(250);
                info!("subscribed to pattern {}", pattern);
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("undecodable pub/sub payload on {}: {}", channel, e);
                            continue;
                        }
                    };
                    let payload: Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("non-JSON pub/sub payload on {}: {}", channel, e);
                            continue;
                        }
                    };
                    handler(ChannelMessage {
                        category: ChannelMessage::category_of(&channel),
                        channel,
                        payload,
                    });
                }
                warn!("pub/sub stream for {} ended, reconnecting", pattern);
                if !adapter.connected.load(Ordering::SeqCst) {
                    // main connection is down too; let the backoff pace both
                    tokio::time::sleep(delay).await;
                }
            }
        });
        Ok(())
    }
}

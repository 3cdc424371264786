/**
 * REQUIREMENT: Room identity and state for per-document collaboration
 * PURPOSE: Track which project/text a room fronts, its members, and usage stats
 * Room ids are a pure function of their metadata so every node derives the same key
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Metadata a room is derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_id: Option<String>,
}

impl RoomMetadata {
    pub fn new(project_id: &str, text_id: Option<&str>) -> Self {
        Self {
            project_id: project_id.to_string(),
            text_id: text_id.map(|t| t.to_string()),
        }
    }

    /// Base composite key: `project:{P}` or `project:{P}:text:{T}`
    pub fn base_id(&self) -> String {
        match &self.text_id {
            Some(text) => format!("project:{}:text:{}", self.project_id, text),
            None => format!("project:{}", self.project_id),
        }
    }

    /// Room id, optionally salt-hashed to prevent enumeration
    pub fn room_id(&self, salt: Option<&str>) -> String {
        let base = self.base_id();
        match salt {
            Some(salt) => {
                let mut hasher = Sha256::new();
                hasher.update(salt.as_bytes());
                hasher.update(base.as_bytes());
                format!("room:{}", &hex::encode(hasher.finalize())[..16])
            }
            None => base,
        }
    }
}

/// Usage counters kept per room
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub total_joins: u64,
    pub peak_users: usize,
    pub message_count: u64,
}

/// Per-member record inside a room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub user_id: String,
    pub username: String,
    pub session_id: uuid::Uuid,
    pub joined_at: DateTime<Utc>,
}

/// A server-side set of sessions sharing fan-out for one document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub metadata: RoomMetadata,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub max_users: usize,
    /// user id -> member record; one entry per user regardless of session count
    pub members: HashMap<String, RoomMember>,
    pub stats: RoomStats,
}

impl Room {
    pub fn new(id: String, metadata: RoomMetadata, max_users: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            metadata,
            created_at: now,
            last_activity: now,
            max_users,
            members: HashMap::new(),
            stats: RoomStats::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_users
    }

    /// Eviction predicate: empty and idle past the threshold
    pub fn is_expired(&self, idle_threshold_ms: u64, now: DateTime<Utc>) -> bool {
        self.members.is_empty()
            && (now - self.last_activity).num_milliseconds() > idle_threshold_ms as i64
    }
}

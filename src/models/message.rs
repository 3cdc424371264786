/**
 * REQUIREMENT: Durable queued messages for offline and absent recipients
 * PURPOSE: Model the per-user/per-room message records with priority, TTL, and retries
 */
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    Queued,
    Delivered,
    Failed,
    DeadLetter,
}

/// Why a message landed in the dead-letter set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    QueueOverflow,
    MaxAttemptsExceeded,
    Expired,
}

/// Who a queued message belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum QueueOwner {
    User(String),
    Room(String),
}

/// A message waiting for delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: Uuid,
    pub owner: QueueOwner,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<DeadLetterReason>,
    /// Room messages: users who already acknowledged delivery.
    /// Serialized as an array; rebuilt as a set on load.
    #[serde(default)]
    pub delivered: HashSet<String>,
    /// Room messages: restrict delivery to this user set when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_users: Option<HashSet<String>>,
}

impl QueuedMessage {
    pub fn new(
        owner: QueueOwner,
        message_type: &str,
        payload: serde_json::Value,
        priority: MessagePriority,
        ttl_ms: i64,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            message_type: message_type.to_string(),
            payload,
            priority,
            timestamp: now,
            expires_at: now + Duration::milliseconds(ttl_ms),
            attempts: 0,
            max_attempts,
            status: MessageStatus::Queued,
            next_retry_at: None,
            dead_letter_reason: None,
            delivered: HashSet::new(),
            target_users: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether this message should be handed to the given user
    pub fn targets_user(&self, user_id: &str) -> bool {
        if self.delivered.contains(user_id) {
            return false;
        }
        match &self.target_users {
            Some(targets) => targets.contains(user_id),
            None => true,
        }
    }

    /// Record a delivery failure and schedule the exponential-backoff retry
    pub fn record_failure(&mut self, base_delay_ms: u64) {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            self.status = MessageStatus::DeadLetter;
            self.dead_letter_reason = Some(DeadLetterReason::MaxAttemptsExceeded);
            self.next_retry_at = None;
        } else {
            self.status = MessageStatus::Failed;
            let delay = base_delay_ms.saturating_mul(2u64.saturating_pow(self.attempts));
            self.next_retry_at = Some(Utc::now() + Duration::milliseconds(delay as i64));
        }
    }
}

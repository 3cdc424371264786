/**
 * REQUIREMENT: Per-(room, user) presence records observable by room peers
 * PURPOSE: Model online/idle/away status, activity flags, and the global rollup
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Away,
    Offline,
}

impl PresenceStatus {
    /// Ordering used for the global rollup: online > idle > away > offline
    fn rank(self) -> u8 {
        match self {
            PresenceStatus::Online => 3,
            PresenceStatus::Idle => 2,
            PresenceStatus::Away => 1,
            PresenceStatus::Offline => 0,
        }
    }

    /// Global status across many rooms is the strongest per-room status
    pub fn merge(statuses: impl IntoIterator<Item = PresenceStatus>) -> PresenceStatus {
        statuses
            .into_iter()
            .max_by_key(|s| s.rank())
            .unwrap_or(PresenceStatus::Offline)
    }
}

/// Activity kinds reported by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    Annotating,
    Viewing,
    CursorMove,
    TextSelect,
    Idle,
    Away,
}

impl ActivityKind {
    /// Broadcast throttle interval per kind, in milliseconds
    pub fn throttle_ms(self) -> u64 {
        match self {
            ActivityKind::CursorMove => 100,
            ActivityKind::TextSelect => 200,
            ActivityKind::Annotating => 1_000,
            ActivityKind::Viewing => 5_000,
            ActivityKind::Idle | ActivityKind::Away => 0,
        }
    }

    /// Any non-idle/away activity implies the user is online
    pub fn implies_online(self) -> bool {
        !matches!(self, ActivityKind::Idle | ActivityKind::Away)
    }
}

/// Activity flags surfaced to peers alongside the status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFlags {
    pub annotating: bool,
    pub viewing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
}

/// One presence record per (room, user)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub username: String,
    pub session_id: uuid::Uuid,
    pub status: PresenceStatus,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub flags: ActivityFlags,
}

impl PresenceRecord {
    pub fn new(user_id: &str, username: &str, session_id: uuid::Uuid, device: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            session_id,
            status: PresenceStatus::Online,
            joined_at: now,
            last_activity: now,
            device,
            flags: ActivityFlags::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Status the periodic re-evaluation timer should assign, given thresholds
    pub fn derived_status(
        &self,
        now: DateTime<Utc>,
        idle_threshold_ms: i64,
        away_threshold_ms: i64,
    ) -> PresenceStatus {
        let age = (now - self.last_activity).num_milliseconds();
        if age > away_threshold_ms {
            PresenceStatus::Away
        } else if age > idle_threshold_ms {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Online
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_status_rollup() {
        // REQUIREMENT: Global status is online iff any room presence is online,
        // else idle if any is idle, else away/offline in that order
        // PURPOSE: Verify the cross-room presence merge

        use PresenceStatus::*;
        assert_eq!(PresenceStatus::merge([Away, Online, Idle]), Online);
        assert_eq!(PresenceStatus::merge([Away, Idle]), Idle);
        assert_eq!(PresenceStatus::merge([Away, Offline]), Away);
        assert_eq!(PresenceStatus::merge([]), Offline);
    }

    #[test]
    fn test_status_derivation_thresholds() {
        // REQUIREMENT: > 15 min inactivity -> away, > 5 min -> idle, else online
        // PURPOSE: Verify the timer-driven state transitions

        let record = PresenceRecord::new("alice", "Alice", uuid::Uuid::new_v4(), None);
        let idle_ms = 5 * 60 * 1000;
        let away_ms = 15 * 60 * 1000;

        let now = record.last_activity + chrono::Duration::minutes(1);
        assert_eq!(record.derived_status(now, idle_ms, away_ms), PresenceStatus::Online);

        let now = record.last_activity + chrono::Duration::minutes(6);
        assert_eq!(record.derived_status(now, idle_ms, away_ms), PresenceStatus::Idle);

        let now = record.last_activity + chrono::Duration::minutes(16);
        assert_eq!(record.derived_status(now, idle_ms, away_ms), PresenceStatus::Away);
    }

    #[test]
    fn test_activity_kind_throttles() {
        assert_eq!(ActivityKind::CursorMove.throttle_ms(), 100);
        assert_eq!(ActivityKind::TextSelect.throttle_ms(), 200);
        assert_eq!(ActivityKind::Annotating.throttle_ms(), 1_000);
        assert_eq!(ActivityKind::Viewing.throttle_ms(), 5_000);
        assert!(ActivityKind::CursorMove.implies_online());
        assert!(!ActivityKind::Idle.implies_online());
    }
}

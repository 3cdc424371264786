/**
 * REQUIREMENT: Per-room user status with heartbeat-driven transitions and
 * kind-specific broadcast throttling
 * PURPOSE: Track who is online/idle/away in each room and tell their peers
 */
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::models::events::{PresenceUpdatePayload, ServerEvent, UserPresencePayload};
use crate::models::presence::{ActivityKind, PresenceRecord, PresenceStatus};
use crate::services::cluster::ClusterAdapter;
use crate::services::room_manager::RoomManager;
use crate::services::throttle::KeyedThrottle;

const IDLE_THRESHOLD_MS: i64 = 5 * 60 * 1000;
const AWAY_THRESHOLD_MS: i64 = 15 * 60 * 1000;

pub struct PresenceTracker {
    rooms: Arc<RoomManager>,
    /// room id -> user id -> presence record
    presence: RwLock<HashMap<String, HashMap<String, PresenceRecord>>>,
    throttle: KeyedThrottle,
    cluster: Option<Arc<ClusterAdapter>>,
}

impl PresenceTracker {
    pub fn new(rooms: Arc<RoomManager>, cluster: Option<Arc<ClusterAdapter>>) -> Self {
        Self {
            rooms,
            presence: RwLock::new(HashMap::new()),
            throttle: KeyedThrottle::new(),
            cluster,
        }
    }

    /// Record a join and announce it to room peers
    pub async fn user_joined(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        session_id: Uuid,
        device: Option<String>,
    ) -> CollabResult<()> {
        let record = PresenceRecord::new(user_id, username, session_id, device);
        self.presence
            .write()
            .unwrap()
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string(), record.clone());

        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.set_presence(room_id, user_id, &record).await {
                e.log_with_context("mirroring presence on join");
            }
        }

        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::UserJoined(UserPresencePayload {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    username: username.to_string(),
                })
                .into(),
                Some(session_id),
            )
            .await;
        Ok(())
    }

    /// Drop the record and announce the departure
    pub async fn user_left(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        let removed = {
            let mut presence = self.presence.write().unwrap();
            let removed = presence
                .get_mut(room_id)
                .and_then(|room| room.remove(user_id));
            if presence.get(room_id).is_some_and(|r| r.is_empty()) {
                presence.remove(room_id);
            }
            removed
        };
        let Some(record) = removed else {
            return Ok(());
        };

        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.delete_presence(room_id, user_id).await {
                e.log_with_context("clearing presence on leave");
            }
        }

        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::UserLeft(UserPresencePayload {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    username: record.username,
                })
                .into(),
                None,
            )
            .await;
        Ok(())
    }

    /// Apply a client-reported activity and broadcast it, throttled per
    /// (room, user, kind) with kind-specific intervals
    pub async fn update_activity(
        &self,
        room_id: &str,
        user_id: &str,
        kind: ActivityKind,
        data: Option<Value>,
    ) -> CollabResult<()> {
        let record = {
            let mut presence = self.presence.write().unwrap();
            let room = presence.get_mut(room_id).ok_or_else(|| {
                CollabError::Presence(format!("no presence map for room {}", room_id))
            })?;
            let record = room.get_mut(user_id).ok_or_else(|| {
                CollabError::Presence(format!("user {} has no presence in {}", user_id, room_id))
            })?;

            record.touch();
            match kind {
                ActivityKind::Annotating => record.flags.annotating = true,
                ActivityKind::Viewing => record.flags.viewing = true,
                ActivityKind::CursorMove => {
                    record.flags.cursor_position = data
                        .as_ref()
                        .and_then(|d| d.get("position"))
                        .and_then(|p| p.as_u64())
                        .map(|p| p as usize);
                }
                ActivityKind::TextSelect => {
                    record.flags.selected_text = data
                        .as_ref()
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                        .map(String::from);
                }
                ActivityKind::Idle => record.status = PresenceStatus::Idle,
                ActivityKind::Away => record.status = PresenceStatus::Away,
            }
            if kind.implies_online() {
                record.status = PresenceStatus::Online;
            }
            record.clone()
        };

        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.set_presence(room_id, user_id, &record).await {
                e.log_with_context("mirroring presence activity");
            }
        }

        let throttle_key = format!("{}:{}:{:?}", room_id, user_id, kind);
        if !self
            .throttle
            .allow(&throttle_key, Duration::from_millis(kind.throttle_ms()))
        {
            return Ok(());
        }

        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::PresenceUpdate(PresenceUpdatePayload {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    status: record.status,
                    event: "activity".to_string(),
                    activity: Some(json!({ "kind": kind, "data": data })),
                })
                .into(),
                None,
            )
            .await;
        Ok(())
    }

    /// Explicit status override (e.g. a client minimizing its window)
    pub async fn set_status(
        &self,
        room_id: &str,
        user_id: &str,
        status: PresenceStatus,
    ) -> CollabResult<()> {
        {
            let mut presence = self.presence.write().unwrap();
            let record = presence
                .get_mut(room_id)
                .and_then(|room| room.get_mut(user_id))
                .ok_or_else(|| {
                    CollabError::Presence(format!(
                        "user {} has no presence in {}",
                        user_id, room_id
                    ))
                })?;
            record.status = status;
            record.touch();
        }
        self.broadcast_status_change(room_id, user_id, status).await;
        Ok(())
    }

    pub fn room_presence(&self, room_id: &str) -> Vec<PresenceRecord> {
        self.presence
            .read()
            .unwrap()
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Global rollup across all rooms a user is present in
    pub fn global_status(&self, user_id: &str) -> PresenceStatus {
        let presence = self.presence.read().unwrap();
        PresenceStatus::merge(
            presence
                .values()
                .filter_map(|room| room.get(user_id))
                .map(|record| record.status),
        )
    }

    /// Timer-driven re-evaluation of every record; transitions publish
    /// a presence-update with event `status-change`
    pub async fn sweep_statuses(&self) {
        let now = chrono::Utc::now();
        let transitions: Vec<(String, String, PresenceStatus, PresenceRecord)> = {
            let mut presence = self.presence.write().unwrap();
            let mut changed = Vec::new();
            for (room_id, room) in presence.iter_mut() {
                for (user_id, record) in room.iter_mut() {
                    let derived = record.derived_status(now, IDLE_THRESHOLD_MS, AWAY_THRESHOLD_MS);
                    if derived != record.status {
                        record.status = derived;
                        changed.push((
                            room_id.clone(),
                            user_id.clone(),
                            derived,
                            record.clone(),
                        ));
                    }
                }
            }
            changed
        };

        for (room_id, user_id, status, record) in transitions {
            debug!("presence transition {}/{} -> {:?}", room_id, user_id, status);
            // refreshing the mirror doubles as the cluster heartbeat
            if let Some(cluster) = &self.cluster {
                if let Err(e) = cluster.set_presence(&room_id, &user_id, &record).await {
                    e.log_with_context("refreshing presence mirror");
                }
            }
            self.broadcast_status_change(&room_id, &user_id, status).await;
        }
    }

    async fn broadcast_status_change(&self, room_id: &str, user_id: &str, status: PresenceStatus) {
        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::PresenceUpdate(PresenceUpdatePayload {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    status,
                    event: "status-change".to_string(),
                    activity: None,
                })
                .into(),
                None,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        let rooms = Arc::new(RoomManager::new(50, 30 * 60 * 1000, None, None));
        PresenceTracker::new(rooms, None)
    }

    #[tokio::test]
    async fn test_single_presence_record_per_room_user() {
        // REQUIREMENT: At most one presence record per (room, user)
        // PURPOSE: Verify a rejoin replaces rather than duplicates the record

        let tracker = tracker();
        tracker
            .user_joined("r1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();
        tracker
            .user_joined("r1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(tracker.room_presence("r1").len(), 1);
    }

    #[tokio::test]
    async fn test_activity_updates_flags_and_status() {
        // REQUIREMENT: Non-idle activity kinds imply online and set activity flags
        // PURPOSE: Verify the flag bookkeeping behind presence broadcasts

        let tracker = tracker();
        tracker
            .user_joined("r1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();

        tracker
            .update_activity("r1", "alice", ActivityKind::Annotating, None)
            .await
            .unwrap();
        let records = tracker.room_presence("r1");
        assert!(records[0].flags.annotating);
        assert_eq!(records[0].status, PresenceStatus::Online);

        tracker
            .update_activity(
                "r1",
                "alice",
                ActivityKind::CursorMove,
                Some(json!({ "position": 42 })),
            )
            .await
            .unwrap();
        let records = tracker.room_presence("r1");
        assert_eq!(records[0].flags.cursor_position, Some(42));
    }

    #[tokio::test]
    async fn test_activity_for_unknown_user_fails() {
        let tracker = tracker();
        let err = tracker
            .update_activity("r1", "ghost", ActivityKind::Viewing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Presence(_)));
    }

    #[tokio::test]
    async fn test_leave_removes_record() {
        let tracker = tracker();
        tracker
            .user_joined("r1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();
        tracker.user_left("r1", "alice").await.unwrap();
        assert!(tracker.room_presence("r1").is_empty());
        // a second leave is a no-op
        tracker.user_left("r1", "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_global_status_spans_rooms() {
        // REQUIREMENT: Global status is the strongest per-room status
        // PURPOSE: Verify the cross-room rollup through the tracker API

        let tracker = tracker();
        tracker
            .user_joined("r1", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();
        tracker
            .user_joined("r2", "alice", "Alice", Uuid::new_v4(), None)
            .await
            .unwrap();

        tracker
            .set_status("r1", "alice", PresenceStatus::Away)
            .await
            .unwrap();
        assert_eq!(tracker.global_status("alice"), PresenceStatus::Online);

        tracker
            .set_status("r2", "alice", PresenceStatus::Idle)
            .await
            .unwrap();
        assert_eq!(tracker.global_status("alice"), PresenceStatus::Idle);
        assert_eq!(tracker.global_status("nobody"), PresenceStatus::Offline);
    }
}

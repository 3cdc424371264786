/**
 * REQUIREMENT: Per-room cursor and selection sharing with a 100 ms coalescing
 * window, and position rewriting when the referenced text changes
 * PURPOSE: Keep remote carets anchored while concurrent edits land
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::error::{CollabError, CollabResult};
use crate::models::cursor::{
    adjust_offset, adjust_selection, CursorState, SelectionRange,
};
use crate::models::events::{
    CursorRemovedPayload, CursorUpdatePayload, CursorsAdjustedPayload, ServerEvent,
};
use crate::models::operation::TextOperation;
use crate::services::room_manager::RoomManager;
use crate::services::throttle::{Coalescer, KeyedThrottle};

const COALESCE_WINDOW: Duration = Duration::from_millis(100);
const SELECTION_THROTTLE: Duration = Duration::from_millis(200);
const STALE_AFTER_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
struct PendingCursor {
    position: usize,
    text_id: String,
}

pub struct CursorTracker {
    rooms: Arc<RoomManager>,
    /// room id -> user id -> cursor state
    cursors: RwLock<HashMap<String, HashMap<String, CursorState>>>,
    coalescer: Coalescer<PendingCursor>,
    selection_throttle: KeyedThrottle,
}

impl CursorTracker {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self {
            rooms,
            cursors: RwLock::new(HashMap::new()),
            coalescer: Coalescer::new(COALESCE_WINDOW),
            selection_throttle: KeyedThrottle::new(),
        }
    }

    /// Buffer a cursor move; only the latest position in the window is broadcast
    pub fn update_cursor(
        self: &Arc<Self>,
        room_id: &str,
        user_id: &str,
        position: usize,
        text_id: &str,
    ) -> CollabResult<()> {
        let key = format!("{}:{}", room_id, user_id);
        let pending = PendingCursor {
            position,
            text_id: text_id.to_string(),
        };
        if let Some(deadline) = self.coalescer.push(&key, pending) {
            let tracker = Arc::clone(self);
            let room_id = room_id.to_string();
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                tracker.flush_cursor(&room_id, &user_id).await;
            });
        }
        Ok(())
    }

    /// Apply and broadcast the latest buffered position for (room, user)
    async fn flush_cursor(&self, room_id: &str, user_id: &str) {
        let key = format!("{}:{}", room_id, user_id);
        let Some(pending) = self.coalescer.flush(&key) else {
            return;
        };
        let state = {
            let mut cursors = self.cursors.write().unwrap();
            let room = cursors.entry(room_id.to_string()).or_default();
            let state = room
                .entry(user_id.to_string())
                .or_insert_with(|| CursorState::new(user_id, &pending.text_id, pending.position));
            state.position = pending.position;
            state.text_id = pending.text_id;
            state.last_update = chrono::Utc::now();
            state.clone()
        };
        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::CursorUpdate(CursorUpdatePayload {
                    room_id: room_id.to_string(),
                    cursor: state,
                })
                .into(),
                None,
            )
            .await;
    }

    /// Record and broadcast a selection; inverted ranges are rejected
    pub async fn update_selection(
        &self,
        room_id: &str,
        user_id: &str,
        selection: SelectionRange,
        text_id: &str,
    ) -> CollabResult<()> {
        if !selection.is_valid() {
            return Err(CollabError::Cursor(format!(
                "selection [{}, {}] is inverted",
                selection.start, selection.end
            )));
        }
        let state = {
            let mut cursors = self.cursors.write().unwrap();
            let room = cursors.entry(room_id.to_string()).or_default();
            let state = room
                .entry(user_id.to_string())
                .or_insert_with(|| CursorState::new(user_id, text_id, selection.end));
            state.selection = Some(selection);
            state.text_id = text_id.to_string();
            state.last_update = chrono::Utc::now();
            state.clone()
        };

        let key = format!("{}:{}", room_id, user_id);
        if !self.selection_throttle.allow(&key, SELECTION_THROTTLE) {
            return Ok(());
        }
        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::SelectionUpdate(CursorUpdatePayload {
                    room_id: room_id.to_string(),
                    cursor: state,
                })
                .into(),
                None,
            )
            .await;
        Ok(())
    }

    /// Remove a user's cursor and tell the room
    pub async fn remove_cursor(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        let removed = {
            let mut cursors = self.cursors.write().unwrap();
            let removed = cursors
                .get_mut(room_id)
                .and_then(|room| room.remove(user_id))
                .is_some();
            if cursors.get(room_id).is_some_and(|r| r.is_empty()) {
                cursors.remove(room_id);
            }
            removed
        };
        if removed {
            self.rooms
                .broadcast(
                    room_id,
                    &ServerEvent::CursorRemoved(CursorRemovedPayload {
                        room_id: room_id.to_string(),
                        user_id: user_id.to_string(),
                    })
                    .into(),
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Rewrite all cursors and selections on (room, text) against an applied
    /// operation, then re-broadcast the adjusted set once
    pub async fn adjust_for_text_change(
        &self,
        room_id: &str,
        text_id: &str,
        operation: &TextOperation,
    ) -> CollabResult<()> {
        let adjusted: Vec<CursorState> = {
            let mut cursors = self.cursors.write().unwrap();
            let Some(room) = cursors.get_mut(room_id) else {
                return Ok(());
            };
            let mut adjusted = Vec::new();
            for state in room.values_mut() {
                if state.text_id != text_id {
                    continue;
                }
                let new_position = adjust_offset(state.position, operation);
                let new_selection = state
                    .selection
                    .and_then(|sel| adjust_selection(sel, operation));
                if new_position != state.position || new_selection != state.selection {
                    state.position = new_position;
                    state.selection = new_selection;
                    state.last_update = chrono::Utc::now();
                    adjusted.push(state.clone());
                }
            }
            adjusted
        };

        if adjusted.is_empty() {
            return Ok(());
        }
        debug!(
            "adjusted {} cursors in {} after {:?}",
            adjusted.len(),
            room_id,
            operation
        );
        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::CursorsAdjusted(CursorsAdjustedPayload {
                    room_id: room_id.to_string(),
                    text_id: text_id.to_string(),
                    cursors: adjusted,
                })
                .into(),
                None,
            )
            .await;
        Ok(())
    }

    pub fn room_cursors(&self, room_id: &str) -> Vec<CursorState> {
        self.cursors
            .read()
            .unwrap()
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 60 s sweep: drop entries whose lastUpdate age exceeds five minutes
    pub fn sweep_stale(&self) -> usize {
        let now = chrono::Utc::now();
        let mut cursors = self.cursors.write().unwrap();
        let mut removed = 0;
        cursors.retain(|_, room| {
            room.retain(|_, state| {
                let stale = (now - state.last_update).num_milliseconds() > STALE_AFTER_MS;
                if stale {
                    removed += 1;
                }
                !stale
            });
            !room.is_empty()
        });
        removed
    }

    /// Drop all state for an evicted room
    pub fn cleanup_room(&self, room_id: &str) {
        self.cursors.write().unwrap().remove(room_id);
        self.coalescer.forget_prefix(&format!("{}:", room_id));
        self.selection_throttle.forget_prefix(&format!("{}:", room_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Arc<CursorTracker> {
        let rooms = Arc::new(RoomManager::new(50, 30 * 60 * 1000, None, None));
        Arc::new(CursorTracker::new(rooms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_updates_coalesce_to_latest() {
        // REQUIREMENT: Only the latest position in a 100 ms window is kept
        // PURPOSE: Verify the coalescing path updates state exactly once

        let tracker = tracker();
        tracker.update_cursor("r1", "alice", 10, "T1").unwrap();
        tracker.update_cursor("r1", "alice", 20, "T1").unwrap();
        tracker.update_cursor("r1", "alice", 30, "T1").unwrap();

        // let the flush task run past the window
        tokio::time::sleep(Duration::from_millis(150)).await;

        let cursors = tracker.room_cursors("r1");
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].position, 30);
    }

    #[tokio::test]
    async fn test_selection_validation() {
        // REQUIREMENT: Selection start must not exceed end
        // PURPOSE: Verify inverted selections are rejected at the boundary

        let tracker = tracker();
        let err = tracker
            .update_selection("r1", "alice", SelectionRange { start: 9, end: 3 }, "T1")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Cursor(_)));

        tracker
            .update_selection("r1", "alice", SelectionRange { start: 3, end: 9 }, "T1")
            .await
            .unwrap();
        let cursors = tracker.room_cursors("r1");
        assert_eq!(cursors[0].selection, Some(SelectionRange { start: 3, end: 9 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_adjusts_later_cursor() {
        // REQUIREMENT: An insert at 30 moves a cursor at 50 to 53
        // PURPOSE: Verify the rewrite path end to end through the tracker

        let tracker = tracker();
        tracker.update_cursor("r1", "alice", 50, "T1").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        tracker
            .adjust_for_text_change(
                "r1",
                "T1",
                &TextOperation::Insert {
                    position: 30,
                    text: "XYZ".to_string(),
                },
            )
            .await
            .unwrap();

        let cursors = tracker.room_cursors("r1");
        assert_eq!(cursors[0].position, 53);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_skips_other_texts() {
        let tracker = tracker();
        tracker.update_cursor("r1", "alice", 50, "T2").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        tracker
            .adjust_for_text_change(
                "r1",
                "T1",
                &TextOperation::Insert {
                    position: 0,
                    text: "abc".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(tracker.room_cursors("r1")[0].position, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cursor() {
        // REQUIREMENT: At most one cursor record per (room, user); removable
        // PURPOSE: Verify removal clears state and empty rooms are cleaned

        let tracker = tracker();
        tracker.update_cursor("r1", "alice", 5, "T1").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.room_cursors("r1").len(), 1);

        tracker.remove_cursor("r1", "alice").await.unwrap();
        assert!(tracker.room_cursors("r1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sweep() {
        let tracker = tracker();
        tracker.update_cursor("r1", "alice", 5, "T1").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // fresh entries survive
        assert_eq!(tracker.sweep_stale(), 0);

        // age the entry past the five-minute threshold
        {
            let mut cursors = tracker.cursors.write().unwrap();
            let state = cursors.get_mut("r1").unwrap().get_mut("alice").unwrap();
            state.last_update = chrono::Utc::now() - chrono::Duration::minutes(6);
        }
        assert_eq!(tracker.sweep_stale(), 1);
        assert!(tracker.room_cursors("r1").is_empty());
    }
}

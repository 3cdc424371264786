/**
 * REQUIREMENT: Per-document rooms with capacity limits, fan-out routing, and
 * idle eviction; cluster mode mirrors every mutation and forwards broadcasts
 * PURPOSE: Track which sessions are in which room and route events between them
 */
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::models::events::OutboundFrame;
use crate::models::room::{Room, RoomMember, RoomMetadata, RoomStats};
use crate::services::cluster::ClusterAdapter;

/// Identity of this server instance on the cluster backplane
fn node_id() -> &'static str {
    use once_cell::sync::Lazy;
    static NODE_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());
    &NODE_ID
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;

pub struct RoomManager {
    max_users: usize,
    idle_threshold_ms: u64,
    room_salt: Option<String>,
    rooms: RwLock<HashMap<String, Room>>,
    /// session id -> outbound transport channel
    outbound: RwLock<HashMap<Uuid, OutboundSender>>,
    /// user id -> live session ids on this node
    user_sessions: RwLock<HashMap<String, HashSet<Uuid>>>,
    cluster: Option<std::sync::Arc<ClusterAdapter>>,
}

impl RoomManager {
    pub fn new(
        max_users: usize,
        idle_threshold_ms: u64,
        room_salt: Option<String>,
        cluster: Option<std::sync::Arc<ClusterAdapter>>,
    ) -> Self {
        Self {
            max_users,
            idle_threshold_ms,
            room_salt,
            rooms: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
            user_sessions: RwLock::new(HashMap::new()),
            cluster,
        }
    }

    /// Derive the room id for a document, honoring the configured salt
    pub fn room_id(&self, metadata: &RoomMetadata) -> String {
        metadata.room_id(self.room_salt.as_deref())
    }

    pub fn node_identity(&self) -> &'static str {
        node_id()
    }

    // --- session registry ---

    pub fn register_session(&self, session_id: Uuid, user_id: &str, sender: OutboundSender) {
        self.outbound.write().unwrap().insert(session_id, sender);
        self.user_sessions
            .write()
            .unwrap()
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id);
    }

    pub fn unregister_session(&self, session_id: Uuid, user_id: &str) {
        self.outbound.write().unwrap().remove(&session_id);
        let mut users = self.user_sessions.write().unwrap();
        if let Some(sessions) = users.get_mut(user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                users.remove(user_id);
            }
        }
    }

    /// A user is online while any of their sessions is registered on this node
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.user_sessions
            .read()
            .unwrap()
            .get(user_id)
            .is_some_and(|s| !s.is_empty())
    }

    // --- membership ---

    /// Join a session into a room, creating the room on first join
    pub async fn join(
        &self,
        session_id: Uuid,
        user_id: &str,
        username: &str,
        metadata: RoomMetadata,
    ) -> CollabResult<Room> {
        let room_id = self.room_id(&metadata);

        // after a restart, room history lives in the cluster store; members do
        // not carry over (each node only holds its own sessions)
        let restored = if !self.rooms.read().unwrap().contains_key(&room_id) {
            match &self.cluster {
                Some(cluster) => match cluster.get_room(&room_id).await {
                    Ok(Some(mut room)) => {
                        room.members.clear();
                        Some(room)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        e.log_with_context("restoring room from cluster store");
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let snapshot = {
            let mut rooms = self.rooms.write().unwrap();
            if let Some(room) = restored {
                rooms.entry(room_id.clone()).or_insert(room);
            }
            let room = rooms
                .entry(room_id.clone())
                .or_insert_with(|| Room::new(room_id.clone(), metadata, self.max_users));

            if !room.members.contains_key(user_id) && room.is_full() {
                return Err(CollabError::RoomFull(room_id));
            }

            room.members.insert(
                user_id.to_string(),
                RoomMember {
                    user_id: user_id.to_string(),
                    username: username.to_string(),
                    session_id,
                    joined_at: chrono::Utc::now(),
                },
            );
            room.stats.total_joins += 1;
            room.stats.peak_users = room.stats.peak_users.max(room.members.len());
            room.touch();
            room.clone()
        };

        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.set_room(&snapshot).await {
                e.log_with_context("mirroring room on join");
            }
            if let Err(e) = cluster.add_user_to_room(&snapshot.id, user_id).await {
                e.log_with_context("mirroring member on join");
            }
        }

        info!(
            "user {} joined room {} ({} members)",
            user_id,
            snapshot.id,
            snapshot.members.len()
        );
        Ok(snapshot)
    }

    /// Remove a user from a room; empty rooms linger until the idle sweep
    pub async fn leave(&self, user_id: &str, room_id: &str) -> CollabResult<()> {
        let found = {
            let mut rooms = self.rooms.write().unwrap();
            match rooms.get_mut(room_id) {
                Some(room) => {
                    let removed = room.members.remove(user_id).is_some();
                    room.touch();
                    removed
                }
                None => false,
            }
        };
        if !found {
            return Err(CollabError::Room(format!(
                "user {} is not a member of {}",
                user_id, room_id
            )));
        }

        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.remove_user_from_room(room_id, user_id).await {
                e.log_with_context("mirroring member on leave");
            }
        }
        debug!("user {} left room {}", user_id, room_id);
        Ok(())
    }

    pub fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .read()
            .unwrap()
            .get(room_id)
            .is_some_and(|room| room.members.contains_key(user_id))
    }

    pub fn get_room(&self, room_id: &str) -> Option<Room> {
        self.rooms.read().unwrap().get(room_id).cloned()
    }

    /// Rooms a user currently belongs to (disconnect cascade)
    pub fn rooms_for_user(&self, user_id: &str) -> Vec<String> {
        self.rooms
            .read()
            .unwrap()
            .iter()
            .filter(|(_, room)| room.members.contains_key(user_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<String> {
        self.rooms.read().unwrap().keys().cloned().collect()
    }

    pub fn stats(&self, room_id: &str) -> Option<RoomStats> {
        self.rooms
            .read()
            .unwrap()
            .get(room_id)
            .map(|room| room.stats.clone())
    }

    pub fn connected_users(&self) -> usize {
        self.user_sessions.read().unwrap().len()
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    pub fn total_messages(&self) -> u64 {
        self.rooms
            .read()
            .unwrap()
            .values()
            .map(|room| room.stats.message_count)
            .sum()
    }

    // --- fan-out ---

    /// Deliver a frame to every local member except `exclude_session`.
    /// The send loop runs under the room-map write lock so each recipient
    /// observes broadcasts in the room's serialization order.
    pub fn broadcast_local(
        &self,
        room_id: &str,
        frame: &OutboundFrame,
        exclude_session: Option<Uuid>,
    ) -> usize {
        let mut rooms = self.rooms.write().unwrap();
        let Some(room) = rooms.get_mut(room_id) else {
            return 0;
        };
        room.stats.message_count += 1;
        room.touch();

        let outbound = self.outbound.read().unwrap();
        let mut delivered = 0;
        for member in room.members.values() {
            if Some(member.session_id) == exclude_session {
                continue;
            }
            if let Some(sender) = outbound.get(&member.session_id) {
                if sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        crate::metrics::record_broadcast(frame.event_name().as_str());
        delivered
    }

    /// Broadcast locally and forward to peer nodes over the backplane
    pub async fn broadcast(
        &self,
        room_id: &str,
        frame: &OutboundFrame,
        exclude_session: Option<Uuid>,
    ) -> usize {
        let delivered = self.broadcast_local(room_id, frame, exclude_session);
        if let Some(cluster) = &self.cluster {
            let envelope = json!({
                "origin": node_id(),
                "roomId": room_id,
                "frame": frame,
            });
            if let Err(e) = cluster
                .publish(&format!("websocket:room:{}", room_id), &envelope)
                .await
            {
                e.log_with_context("forwarding broadcast to cluster");
            }
        }
        delivered
    }

    /// Handle a broadcast envelope received from a peer node
    pub fn handle_cluster_broadcast(&self, payload: &serde_json::Value) {
        let Some(origin) = payload.get("origin").and_then(|v| v.as_str()) else {
            return;
        };
        if origin == node_id() {
            return;
        }
        let (Some(room_id), Some(frame)) = (
            payload.get("roomId").and_then(|v| v.as_str()),
            payload.get("frame"),
        ) else {
            warn!("malformed cluster broadcast envelope");
            return;
        };
        // Re-encode into a raw frame; peers send fully rendered events
        match serde_json::from_value::<crate::models::events::ServerEvent>(frame.clone()) {
            Ok(event) => {
                self.broadcast_local(room_id, &event.into(), None);
            }
            Err(e) => warn!("undecodable cluster frame for {}: {}", room_id, e),
        }
    }

    /// Deliver to one member of a room; false when the user has no live session here
    pub fn send_to_user(&self, room_id: &str, user_id: &str, frame: &OutboundFrame) -> bool {
        let rooms = self.rooms.read().unwrap();
        let Some(member) = rooms
            .get(room_id)
            .and_then(|room| room.members.get(user_id))
        else {
            return false;
        };
        let outbound = self.outbound.read().unwrap();
        outbound
            .get(&member.session_id)
            .map(|sender| sender.send(frame.clone()).is_ok())
            .unwrap_or(false)
    }

    /// Deliver to a specific session regardless of room membership
    pub fn send_to_session(&self, session_id: Uuid, frame: OutboundFrame) -> bool {
        self.outbound
            .read()
            .unwrap()
            .get(&session_id)
            .map(|sender| sender.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Deliver to every live session of a user on this node
    pub fn send_to_user_sessions(&self, user_id: &str, frame: &OutboundFrame) -> usize {
        let sessions = self.user_sessions.read().unwrap();
        let Some(ids) = sessions.get(user_id) else {
            return 0;
        };
        let outbound = self.outbound.read().unwrap();
        ids.iter()
            .filter_map(|id| outbound.get(id))
            .filter(|sender| sender.send(frame.clone()).is_ok())
            .count()
    }

    // --- eviction ---

    /// Background sweep: destroy empty rooms idle past the threshold
    pub async fn sweep_idle_rooms(&self) -> Vec<String> {
        let now = chrono::Utc::now();
        let expired: Vec<String> = {
            let rooms = self.rooms.read().unwrap();
            rooms
                .values()
                .filter(|room| room.is_expired(self.idle_threshold_ms, now))
                .map(|room| room.id.clone())
                .collect()
        };
        if expired.is_empty() {
            return expired;
        }
        {
            let mut rooms = self.rooms.write().unwrap();
            for id in &expired {
                rooms.remove(id);
            }
        }
        for id in &expired {
            info!("evicted idle room {}", id);
            if let Some(cluster) = &self.cluster {
                if let Err(e) = cluster.delete_room(id).await {
                    e.log_with_context("removing evicted room from cluster store");
                }
            }
        }
        expired
    }
}

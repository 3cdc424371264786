/**
 * REQUIREMENT: Validate bearer credentials on connect, resolve the user, rate
 * limit their events, dispatch frames to handlers, and drive the disconnect
 * cascade when the transport closes
 * PURPOSE: The session gate and the per-connection event loop
 */
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::auth::models::AuthenticatedUser;
use crate::auth::rate_limit::RateLimiter;
use crate::auth::services::AuthService;
use crate::error::{CollabError, CollabResult, ErrorFrame};
use crate::models::events::{
    ClientEvent, OutboundFrame, RoomStatePayload, ServerEvent, TextOperationAppliedPayload,
};
use crate::models::presence::ActivityKind;
use crate::models::room::RoomMetadata;
use crate::services::annotations::AnnotationBroadcaster;
use crate::services::cursor::CursorTracker;
use crate::services::notifications::NotificationDispatcher;
use crate::services::ot::OtEngine;
use crate::services::presence::PresenceTracker;
use crate::services::room_manager::RoomManager;

/// Every client RPC gets this deadline; elapsed calls return TIMEOUT_ERROR
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// One authenticated bidirectional connection
pub struct Session {
    pub id: Uuid,
    pub user: AuthenticatedUser,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub joined_rooms: RwLock<HashSet<String>>,
}

impl Session {
    fn new(user: AuthenticatedUser, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            remote_addr,
            connected_at: Utc::now(),
            joined_rooms: RwLock::new(HashSet::new()),
        }
    }
}

pub struct SessionGate {
    auth: AuthService,
    rate_limiter: RateLimiter,
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceTracker>,
    cursors: Arc<CursorTracker>,
    annotations: Arc<AnnotationBroadcaster>,
    ot: Arc<OtEngine>,
    notifications: Arc<NotificationDispatcher>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthService,
        rate_limiter: RateLimiter,
        rooms: Arc<RoomManager>,
        presence: Arc<PresenceTracker>,
        cursors: Arc<CursorTracker>,
        annotations: Arc<AnnotationBroadcaster>,
        ot: Arc<OtEngine>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            auth,
            rate_limiter,
            rooms,
            presence,
            cursors,
            annotations,
            ot,
            notifications,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Handle one WebSocket connection for its whole lifetime
    pub async fn handle_socket(
        self: Arc<Self>,
        websocket: WebSocket,
        token: Option<String>,
        remote_addr: Option<SocketAddr>,
    ) {
        let (mut ws_tx, mut ws_rx) = websocket.split();

        let user = match self.auth.authenticate(token.as_deref()).await {
            Ok(user) => user,
            Err(e) => {
                e.log_with_context("session handshake");
                let frame = e.to_frame(None);
                if let Ok(json) = serde_json::to_string(&frame) {
                    let _ = ws_tx.send(Message::text(json)).await;
                }
                let _ = ws_tx.close().await;
                return;
            }
        };

        let session = Arc::new(Session::new(user, remote_addr));
        info!(
            "session {} opened for user {} from {:?}",
            session.id, session.user.id, session.remote_addr
        );
        crate::metrics::record_connection_opened();

        // outbound pump: the session is single-writer to its own transport
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("unserializable outbound frame: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
        });

        self.rooms
            .register_session(session.id, &session.user.id, tx);
        self.sessions
            .write()
            .unwrap()
            .insert(session.id, Arc::clone(&session));

        // inbound loop
        while let Some(message) = ws_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("transport error on session {}: {}", session.id, e);
                    break;
                }
            };
            if message.is_close() {
                break;
            }
            let Ok(text) = message.to_str() else {
                continue;
            };

            let event = match serde_json::from_str::<ClientEvent>(text) {
                Ok(event) => event,
                Err(e) => {
                    let err = CollabError::Validation(format!("undecodable frame: {}", e));
                    self.rooms
                        .send_to_session(session.id, err.to_frame(None).into());
                    continue;
                }
            };
            self.handle_event(&session, event).await;
        }

        self.disconnect(&session).await;
        writer.abort();
    }

    /// Rate-limit, dispatch with a deadline, and surface failures as error
    /// frames to the originating session only
    pub async fn handle_event(&self, session: &Session, event: ClientEvent) {
        let event_name = event.name();
        crate::metrics::record_event(event_name);

        if let Err(e) = self.rate_limiter.check(&session.user.id) {
            self.rooms
                .send_to_session(session.id, ErrorFrame::with_event(&e, event_name).into());
            return;
        }

        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(RPC_TIMEOUT, self.dispatch(session, event)).await {
            Ok(result) => result,
            Err(_) => Err(CollabError::Timeout(event_name.to_string())),
        };
        crate::metrics::record_event_duration(event_name, started.elapsed().as_secs_f64());

        if let Err(e) = result {
            tracing::error!(
                session_id = %session.id,
                user_id = %session.user.id,
                event = event_name,
                "handler failed: {}",
                e
            );
            crate::metrics::record_error(e.code());
            self.rooms
                .send_to_session(session.id, ErrorFrame::with_event(&e, event_name).into());
        }
    }

    /// The handler table: one arm per inbound event name
    async fn dispatch(&self, session: &Session, event: ClientEvent) -> CollabResult<()> {
        match event {
            ClientEvent::JoinProject(payload) => {
                self.join_project(session, &payload.project_id, payload.text_id.as_deref())
                    .await
            }
            ClientEvent::LeaveProject(payload) => {
                let metadata =
                    RoomMetadata::new(&payload.project_id, payload.text_id.as_deref());
                let room_id = self.rooms.room_id(&metadata);
                self.leave_room(session, &room_id).await
            }
            ClientEvent::AnnotationCreate(payload) => {
                self.annotations
                    .create(session.id, &session.user, &payload.room_id, payload.annotation)
                    .await?;
                self.presence
                    .update_activity(
                        &payload.room_id,
                        &session.user.id,
                        ActivityKind::Annotating,
                        None,
                    )
                    .await
                    .ok();
                Ok(())
            }
            ClientEvent::AnnotationUpdate(payload) => {
                self.annotations
                    .update(session.id, &session.user, &payload.room_id, payload.annotation)
                    .await?;
                Ok(())
            }
            ClientEvent::AnnotationDelete(payload) => {
                self.annotations
                    .delete(
                        session.id,
                        &session.user,
                        &payload.room_id,
                        payload.annotation_id,
                    )
                    .await
            }
            ClientEvent::CursorPosition(payload) => {
                self.require_membership(&payload.room_id, session)?;
                self.cursors.update_cursor(
                    &payload.room_id,
                    &session.user.id,
                    payload.position,
                    &payload.text_id,
                )?;
                self.presence
                    .update_activity(
                        &payload.room_id,
                        &session.user.id,
                        ActivityKind::CursorMove,
                        Some(serde_json::json!({ "position": payload.position })),
                    )
                    .await
                    .ok();
                Ok(())
            }
            ClientEvent::TextSelection(payload) => {
                self.require_membership(&payload.room_id, session)?;
                self.cursors
                    .update_selection(
                        &payload.room_id,
                        &session.user.id,
                        payload.selection,
                        &payload.text_id,
                    )
                    .await?;
                self.presence
                    .update_activity(
                        &payload.room_id,
                        &session.user.id,
                        ActivityKind::TextSelect,
                        None,
                    )
                    .await
                    .ok();
                Ok(())
            }
            ClientEvent::TextOperation(payload) => {
                self.require_membership(&payload.room_id, session)?;
                if let Some(length) = payload.document_length {
                    payload.operation.validate(length)?;
                }
                let envelope = self.ot.transform_operation(
                    payload.operation,
                    &payload.observed_state,
                    &payload.room_id,
                    &payload.text_id,
                    &session.user.id,
                )?;
                self.rooms
                    .broadcast(
                        &payload.room_id,
                        &ServerEvent::TextOperationApplied(TextOperationAppliedPayload {
                            room_id: payload.room_id.clone(),
                            operation: envelope.clone(),
                        })
                        .into(),
                        Some(session.id),
                    )
                    .await;
                self.cursors
                    .adjust_for_text_change(&payload.room_id, &payload.text_id, &envelope.operation)
                    .await
            }
            ClientEvent::CommentCreate(payload) => {
                self.annotations
                    .comment(
                        &session.user,
                        &payload.room_id,
                        payload.annotation_id,
                        payload.comment,
                    )
                    .await?;
                Ok(())
            }
            ClientEvent::SendNotification(payload) => {
                self.require_membership(&payload.room_id, session)?;
                self.notifications
                    .send(
                        &payload.room_id,
                        &payload.notification,
                        payload.target_users.as_ref(),
                        &session.user.id,
                    )
                    .await?;
                Ok(())
            }
            ClientEvent::NotificationRead(payload) => {
                self.notifications
                    .mark_read(payload.notification_id, &session.user.id);
                Ok(())
            }
        }
    }

    /// Join flow: project access check, room join, presence record, one
    /// room-state snapshot, then the queued-notification flush
    async fn join_project(
        &self,
        session: &Session,
        project_id: &str,
        text_id: Option<&str>,
    ) -> CollabResult<()> {
        self.auth
            .check_project_access(project_id, &session.user.id)
            .await?;

        let metadata = RoomMetadata::new(project_id, text_id);
        let room = self
            .rooms
            .join(session.id, &session.user.id, &session.user.username, metadata)
            .await?;
        session.joined_rooms.write().unwrap().insert(room.id.clone());

        self.presence
            .user_joined(
                &room.id,
                &session.user.id,
                &session.user.username,
                session.id,
                None,
            )
            .await?;

        let snapshot = ServerEvent::RoomState(RoomStatePayload {
            room_id: room.id.clone(),
            members: self.presence.room_presence(&room.id),
            cursors: self.cursors.room_cursors(&room.id),
            annotations: self.annotations.room_annotations(&room.id),
            stats: room.stats.clone(),
        });
        self.rooms.send_to_session(session.id, snapshot.into());

        match self
            .notifications
            .flush_queued(session.id, &session.user.id, &room.id)
        {
            Ok(0) => {}
            Ok(count) => debug!("flushed {} queued messages on join", count),
            Err(e) => e.log_with_context("queued-notification flush"),
        }
        Ok(())
    }

    async fn leave_room(&self, session: &Session, room_id: &str) -> CollabResult<()> {
        session.joined_rooms.write().unwrap().remove(room_id);
        self.rooms.leave(&session.user.id, room_id).await?;
        self.presence.user_left(room_id, &session.user.id).await?;
        self.cursors.remove_cursor(room_id, &session.user.id).await?;
        Ok(())
    }

    /// Transport close: leave every joined room, then unregister
    async fn disconnect(&self, session: &Session) {
        let joined: Vec<String> = session.joined_rooms.read().unwrap().iter().cloned().collect();
        for room_id in joined {
            if let Err(e) = self.leave_room(session, &room_id).await {
                e.log_with_context("disconnect cascade");
            }
        }
        self.rooms.unregister_session(session.id, &session.user.id);
        self.sessions.write().unwrap().remove(&session.id);
        if !self.rooms.is_user_online(&session.user.id) {
            self.rate_limiter.remove(&session.user.id);
        }
        crate::metrics::record_connection_closed();
        info!("session {} closed for user {}", session.id, session.user.id);
    }

    fn require_membership(&self, room_id: &str, session: &Session) -> CollabResult<()> {
        if self.rooms.is_member(room_id, &session.user.id) {
            Ok(())
        } else {
            Err(CollabError::Authorization(format!(
                "user {} is not a member of room {}",
                session.user.id, room_id
            )))
        }
    }

    /// Test and integration hook: open a session without a transport
    #[cfg(test)]
    pub fn open_session_for_test(
        &self,
        user: AuthenticatedUser,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let session = Arc::new(Session::new(user, None));
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms.register_session(session.id, &session.user.id, tx);
        self.sessions
            .write()
            .unwrap()
            .insert(session.id, Arc::clone(&session));
        (session, rx)
    }
}

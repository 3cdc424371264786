/**
 * REQUIREMENT: Structured communication protocol for collaboration frames
 * PURPOSE: Define the explicit, versioned payload schema at the wire boundary
 * Each frame is `{event, payload}`; unknown payload fields ride along as blobs
 */
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::ErrorFrame;
use crate::models::annotation::{Annotation, AnnotationComment, AnnotationDraft};
use crate::models::conflict::Conflict;
use crate::models::cursor::{CursorState, SelectionRange};
use crate::models::message::QueuedMessage;
use crate::models::notification::{Notification, NotificationRequest};
use crate::models::operation::{OperationEnvelope, StateVector, TextOperation};
use crate::models::presence::{PresenceRecord, PresenceStatus};
use crate::models::room::RoomStats;

/// Events clients send to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinProject(JoinProjectPayload),
    LeaveProject(JoinProjectPayload),
    AnnotationCreate(AnnotationCreatePayload),
    AnnotationUpdate(AnnotationUpdatePayload),
    AnnotationDelete(AnnotationDeletePayload),
    CursorPosition(CursorPositionPayload),
    TextSelection(TextSelectionPayload),
    TextOperation(TextOperationPayload),
    CommentCreate(CommentCreatePayload),
    SendNotification(SendNotificationPayload),
    NotificationRead(NotificationReadPayload),
}

impl ClientEvent {
    /// Wire name, used for rate-limit accounting and error context
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinProject(_) => "join-project",
            ClientEvent::LeaveProject(_) => "leave-project",
            ClientEvent::AnnotationCreate(_) => "annotation-create",
            ClientEvent::AnnotationUpdate(_) => "annotation-update",
            ClientEvent::AnnotationDelete(_) => "annotation-delete",
            ClientEvent::CursorPosition(_) => "cursor-position",
            ClientEvent::TextSelection(_) => "text-selection",
            ClientEvent::TextOperation(_) => "text-operation",
            ClientEvent::CommentCreate(_) => "comment-create",
            ClientEvent::SendNotification(_) => "send-notification",
            ClientEvent::NotificationRead(_) => "notification-read",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinProjectPayload {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationCreatePayload {
    pub annotation: AnnotationDraft,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationUpdatePayload {
    pub annotation: Annotation,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDeletePayload {
    pub annotation_id: Uuid,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPositionPayload {
    pub room_id: String,
    pub position: usize,
    pub text_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSelectionPayload {
    pub room_id: String,
    pub selection: SelectionRange,
    pub text_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOperationPayload {
    pub room_id: String,
    pub text_id: String,
    pub operation: TextOperation,
    /// Server sequences the client had seen when it emitted the op
    #[serde(default)]
    pub observed_state: StateVector,
    /// Client-side document length, used to bounds-check the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_length: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentCreatePayload {
    pub annotation_id: Uuid,
    pub comment: String,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendNotificationPayload {
    pub room_id: String,
    pub notification: NotificationRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_users: Option<HashSet<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReadPayload {
    pub notification_id: Uuid,
}

/// Events the server emits to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    RoomState(RoomStatePayload),
    UserJoined(UserPresencePayload),
    UserLeft(UserPresencePayload),
    PresenceUpdate(PresenceUpdatePayload),
    CursorUpdate(CursorUpdatePayload),
    CursorRemoved(CursorRemovedPayload),
    CursorsAdjusted(CursorsAdjustedPayload),
    SelectionUpdate(CursorUpdatePayload),
    AnnotationCreated(AnnotationEventPayload),
    AnnotationUpdated(AnnotationEventPayload),
    AnnotationDeleted(AnnotationDeletedPayload),
    AnnotationCreatedConfirm(AnnotationConfirmPayload),
    AnnotationConflict(AnnotationConflictPayload),
    TextOperationApplied(TextOperationAppliedPayload),
    CommentCreated(CommentCreatedPayload),
    Notification(NotificationPayload),
    QueuedNotifications(QueuedNotificationsPayload),
    ConflictResolved(ConflictResolvedPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatePayload {
    pub room_id: String,
    pub members: Vec<PresenceRecord>,
    pub cursors: Vec<CursorState>,
    pub annotations: Vec<Annotation>,
    pub stats: RoomStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresencePayload {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdatePayload {
    pub room_id: String,
    pub user_id: String,
    pub status: PresenceStatus,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdatePayload {
    pub room_id: String,
    pub cursor: CursorState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRemovedPayload {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorsAdjustedPayload {
    pub room_id: String,
    pub text_id: String,
    pub cursors: Vec<CursorState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationEventPayload {
    pub room_id: String,
    pub annotation: Annotation,
    pub author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDeletedPayload {
    pub room_id: String,
    pub annotation_id: Uuid,
    pub author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationConfirmPayload {
    pub room_id: String,
    /// Echo of the client-chosen id so optimistic UI can reconcile
    pub local_id: String,
    pub annotation: Annotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationConflictPayload {
    pub room_id: String,
    pub conflicts: Vec<Conflict>,
    pub annotation: Annotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOperationAppliedPayload {
    pub room_id: String,
    pub operation: OperationEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentCreatedPayload {
    pub room_id: String,
    pub comment: AnnotationComment,
    pub author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub room_id: String,
    pub notification: Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedNotificationsPayload {
    pub messages: Vec<QueuedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolvedPayload {
    pub room_id: String,
    pub conflict: Conflict,
}

/// Everything that can travel down a session's transport
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Event(Box<ServerEvent>),
    Error(ErrorFrame),
}

impl From<ServerEvent> for OutboundFrame {
    fn from(event: ServerEvent) -> Self {
        OutboundFrame::Event(Box::new(event))
    }
}

impl From<ErrorFrame> for OutboundFrame {
    fn from(frame: ErrorFrame) -> Self {
        OutboundFrame::Error(frame)
    }
}

impl OutboundFrame {
    /// Wire name of the frame, for ordering assertions and logs
    pub fn event_name(&self) -> String {
        match self {
            OutboundFrame::Error(_) => "error".to_string(),
            OutboundFrame::Event(event) => serde_json::to_value(event.as_ref())
                .ok()
                .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_decoding() {
        // REQUIREMENT: Inbound frames are {event, payload} with kebab-case names
        // PURPOSE: Verify the dispatch-relevant events decode into typed payloads

        let frame = json!({
            "event": "join-project",
            "payload": { "projectId": "P1", "textId": "T1" }
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        match &event {
            ClientEvent::JoinProject(p) => {
                assert_eq!(p.project_id, "P1");
                assert_eq!(p.text_id.as_deref(), Some("T1"));
            }
            _ => panic!("expected join-project"),
        }
        assert_eq!(event.name(), "join-project");

        let frame = json!({
            "event": "cursor-position",
            "payload": { "roomId": "project:P1:text:T1", "position": 50, "textId": "T1" }
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        assert!(matches!(event, ClientEvent::CursorPosition(_)));
    }

    #[test]
    fn test_text_operation_payload_decoding() {
        // REQUIREMENT: text-operation payloads carry the op fields and textId
        // PURPOSE: Verify the operation wire shape the transform engine consumes

        let frame = json!({
            "event": "text-operation",
            "payload": {
                "roomId": "project:P1:text:T1",
                "textId": "T1",
                "operation": { "type": "insert", "position": 30, "text": "XYZ" },
                "observedState": { "alice": 4 }
            }
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        match event {
            ClientEvent::TextOperation(p) => {
                assert_eq!(p.text_id, "T1");
                assert_eq!(p.observed_state.get("alice"), Some(&4));
                assert!(matches!(
                    p.operation,
                    TextOperation::Insert { position: 30, .. }
                ));
            }
            _ => panic!("expected text-operation"),
        }
    }

    #[test]
    fn test_server_event_encoding() {
        // REQUIREMENT: Server frames follow the same {event, payload} shape
        // PURPOSE: Verify outbound encoding, including the kebab-case event names

        let event = ServerEvent::UserJoined(UserPresencePayload {
            room_id: "project:P1".to_string(),
            user_id: "alice".to_string(),
            username: "Alice".to_string(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "user-joined");
        assert_eq!(value["payload"]["userId"], "alice");

        let frame: OutboundFrame = event.into();
        assert_eq!(frame.event_name(), "user-joined");
    }

    #[test]
    fn test_error_frame_is_untagged() {
        // REQUIREMENT: Error frames are flat {error, code, ...} objects
        // PURPOSE: Verify the untagged outbound encoding of errors

        let frame: OutboundFrame = crate::error::CollabError::RateLimited.to_frame(None).into();
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["error"], true);
        assert_eq!(value["code"], "RATE_LIMIT_ERROR");
        assert!(value.get("event").is_none());
        assert_eq!(frame.event_name(), "error");
    }
}

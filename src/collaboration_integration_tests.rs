/**
 * REQUIREMENT: End-to-end behavior of the collaboration stack: join flow,
 * annotation fan-out, cursor rewrites, conflicts, offline queues, rate limits
 * PURPOSE: Exercise the session gate with the full service wiring, no sockets
 */
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::models::{AuthenticatedUser, UserRole};
use crate::auth::rate_limit::RateLimiter;
use crate::auth::services::AuthService;
use crate::config::QueueConfig;
use crate::models::events::*;
use crate::models::message::MessagePriority;
use crate::models::notification::NotificationRequest;
use crate::models::operation::TextOperation;
use crate::models::room::RoomMetadata;
use crate::services::annotations::AnnotationBroadcaster;
use crate::services::conflict::ConflictResolver;
use crate::services::cursor::CursorTracker;
use crate::services::notifications::NotificationDispatcher;
use crate::services::ot::OtEngine;
use crate::services::presence::PresenceTracker;
use crate::services::queue::MessageQueue;
use crate::services::rest_api::RestApiClient;
use crate::services::room_manager::RoomManager;
use crate::services::session::{Session, SessionGate};

const ROOM: &str = "project:P1:text:T1";

struct TestStack {
    gate: Arc<SessionGate>,
    rooms: Arc<RoomManager>,
    queue: Arc<MessageQueue>,
    notifications: Arc<NotificationDispatcher>,
    _rest: mockito::ServerGuard,
}

fn test_queue_config() -> QueueConfig {
    QueueConfig {
        max_queue_size: 1_000,
        max_retry_attempts: 3,
        retry_base_delay_ms: 5_000,
        message_ttl_ms: 7 * 24 * 60 * 60 * 1000,
    }
}

fn assemble(rest: mockito::ServerGuard) -> TestStack {
    let rest_client = Arc::new(RestApiClient::new(&rest.url()));
    let auth = AuthService::new("test-jwt-secret", rest_client);
    let rate_limiter = RateLimiter::new(100, 60_000);

    let rooms = Arc::new(RoomManager::new(50, 30 * 60 * 1000, None, None));
    let presence = Arc::new(PresenceTracker::new(Arc::clone(&rooms), None));
    let cursors = Arc::new(CursorTracker::new(Arc::clone(&rooms)));
    let ot = Arc::new(OtEngine::new());
    let conflicts = Arc::new(ConflictResolver::new());
    let queue = Arc::new(MessageQueue::new(test_queue_config(), None));
    let notifications = Arc::new(NotificationDispatcher::new(
        Arc::clone(&rooms),
        Arc::clone(&queue),
    ));
    let annotations = Arc::new(AnnotationBroadcaster::new(
        Arc::clone(&rooms),
        Arc::clone(&ot),
        Arc::clone(&conflicts),
        Arc::clone(&queue),
        None,
    ));
    let gate = Arc::new(SessionGate::new(
        auth,
        rate_limiter,
        Arc::clone(&rooms),
        presence,
        cursors,
        annotations,
        ot,
        Arc::clone(&notifications),
    ));
    TestStack {
        gate,
        rooms,
        queue,
        notifications,
        _rest: rest,
    }
}

async fn stack() -> TestStack {
    let mut rest = mockito::Server::new_async().await;
    // every project access check passes in these tests
    rest.mock(
        "GET",
        mockito::Matcher::Regex(r"^/api/projects/.+/access/.+$".to_string()),
    )
    .with_status(200)
    .expect_at_least(0)
    .create_async()
    .await;
    assemble(rest)
}

fn user(id: &str) -> AuthenticatedUser {
    AuthenticatedUser::new(id, id, UserRole::Annotator, Default::default())
}

fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::to_value(&frame).unwrap());
    }
    frames
}

fn names(frames: &[serde_json::Value]) -> Vec<String> {
    frames
        .iter()
        .map(|f| {
            f.get("event")
                .and_then(|e| e.as_str())
                .unwrap_or("error")
                .to_string()
        })
        .collect()
}

async fn join(stack: &TestStack, session: &Session) {
    stack
        .gate
        .handle_event(
            session,
            ClientEvent::JoinProject(JoinProjectPayload {
                project_id: "P1".to_string(),
                text_id: Some("T1".to_string()),
            }),
        )
        .await;
}

#[tokio::test]
async fn test_two_client_highlight_broadcast() {
    // REQUIREMENT: Alice's annotation-create yields a confirm with her localId
    // for her and annotation-created with her name for Bob
    // PURPOSE: Verify the primary collaboration path through the full stack

    let stack = stack().await;
    let (alice, mut alice_rx) = stack.gate.open_session_for_test(user("alice"));
    let (bob, mut bob_rx) = stack.gate.open_session_for_test(user("bob"));
    join(&stack, &alice).await;
    join(&stack, &bob).await;

    let alice_frames = drain(&mut alice_rx);
    // alice saw her own room-state and bob's arrival
    assert!(names(&alice_frames).contains(&"room-state".to_string()));
    assert!(names(&alice_frames).contains(&"user-joined".to_string()));
    drain(&mut bob_rx);

    let draft = serde_json::from_value(serde_json::json!({
        "localId": "L1",
        "textId": "T1",
        "startOffset": 10,
        "endOffset": 20,
        "text": "machine lear",
        "labels": ["L_k"],
    }))
    .unwrap();
    stack
        .gate
        .handle_event(
            &alice,
            ClientEvent::AnnotationCreate(AnnotationCreatePayload {
                annotation: draft,
                room_id: ROOM.to_string(),
            }),
        )
        .await;

    let alice_frames = drain(&mut alice_rx);
    let confirm = alice_frames
        .iter()
        .find(|f| f["event"] == "annotation-created-confirm")
        .expect("author confirmation");
    assert_eq!(confirm["payload"]["localId"], "L1");
    assert!(confirm["payload"]["annotation"]["id"].is_string());
    // the author did not receive her own broadcast
    assert!(!names(&alice_frames).contains(&"annotation-created".to_string()));

    let bob_frames = drain(&mut bob_rx);
    let created = bob_frames
        .iter()
        .find(|f| f["event"] == "annotation-created")
        .expect("peer broadcast");
    assert_eq!(created["payload"]["author"], "alice");
    assert_eq!(created["payload"]["annotation"]["startOffset"], 10);
}

#[tokio::test]
async fn test_insert_rewrites_later_cursor() {
    // REQUIREMENT: Bob's insert(30, "XYZ") moves Alice's cursor at 50 to 53 via
    // one cursors-adjusted event; text-operation-applied reaches Alice, not Bob
    // PURPOSE: Verify the edit-vs-cursor interplay end to end

    let stack = stack().await;
    let (alice, mut alice_rx) = stack.gate.open_session_for_test(user("alice"));
    let (bob, mut bob_rx) = stack.gate.open_session_for_test(user("bob"));
    join(&stack, &alice).await;
    join(&stack, &bob).await;

    stack
        .gate
        .handle_event(
            &alice,
            ClientEvent::CursorPosition(CursorPositionPayload {
                room_id: ROOM.to_string(),
                position: 50,
                text_id: "T1".to_string(),
            }),
        )
        .await;
    // let the coalescing window flush
    tokio::time::sleep(Duration::from_millis(150)).await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    stack
        .gate
        .handle_event(
            &bob,
            ClientEvent::TextOperation(TextOperationPayload {
                room_id: ROOM.to_string(),
                text_id: "T1".to_string(),
                operation: TextOperation::Insert {
                    position: 30,
                    text: "XYZ".to_string(),
                },
                observed_state: Default::default(),
                document_length: Some(100),
            }),
        )
        .await;

    let alice_frames = drain(&mut alice_rx);
    let alice_names = names(&alice_frames);
    assert!(alice_names.contains(&"text-operation-applied".to_string()));
    let adjusted = alice_frames
        .iter()
        .find(|f| f["event"] == "cursors-adjusted")
        .expect("cursor adjustment");
    assert_eq!(adjusted["payload"]["cursors"][0]["position"], 53);

    // the author does not get the applied echo
    let bob_names = names(&drain(&mut bob_rx));
    assert!(!bob_names.contains(&"text-operation-applied".to_string()));
}

#[tokio::test]
async fn test_concurrent_overlap_conflict() {
    // REQUIREMENT: Overlapping annotations with conflicting labels are both
    // admitted; the room hears annotation-conflict with a high-severity
    // label-conflict; a resolution task is enqueued
    // PURPOSE: Verify the conflict path through the gate

    let stack = stack().await;
    let (alice, mut alice_rx) = stack.gate.open_session_for_test(user("alice"));
    let (bob, _bob_rx) = stack.gate.open_session_for_test(user("bob"));
    join(&stack, &alice).await;
    join(&stack, &bob).await;
    drain(&mut alice_rx);

    for (session, local_id, range, label) in [
        (&alice, "L1", (100usize, 130usize), "positive"),
        (&bob, "L2", (120, 150), "negative"),
    ] {
        let draft = serde_json::from_value(serde_json::json!({
            "localId": local_id,
            "textId": "T1",
            "startOffset": range.0,
            "endOffset": range.1,
            "text": "x",
            "labels": [label],
        }))
        .unwrap();
        stack
            .gate
            .handle_event(
                session,
                ClientEvent::AnnotationCreate(AnnotationCreatePayload {
                    annotation: draft,
                    room_id: ROOM.to_string(),
                }),
            )
            .await;
    }

    let alice_frames = drain(&mut alice_rx);
    let conflict = alice_frames
        .iter()
        .find(|f| f["event"] == "annotation-conflict")
        .expect("conflict broadcast");
    let conflicts = conflict["payload"]["conflicts"].as_array().unwrap();
    assert!(conflicts
        .iter()
        .any(|c| c["conflictType"] == "label-conflict" && c["severity"] == "high"));

    // a resolution task landed on the room queue
    assert!(stack.queue.depth() >= 1);
}

#[tokio::test]
async fn test_offline_queued_notification_flushes_once() {
    // REQUIREMENT: An offline user's high-priority notification is queued; on
    // reconnect-and-join it arrives in one queued-notifications frame; a second
    // join does not resend it
    // PURPOSE: Verify the offline delivery loop

    let stack = stack().await;
    let targets: HashSet<String> = ["carol".to_string()].into();
    stack
        .notifications
        .send(
            ROOM,
            &NotificationRequest {
                notification_type: "mention".to_string(),
                title: None,
                message: None,
                data: Default::default(),
                priority: Some(MessagePriority::High),
            },
            Some(&targets),
            "alice",
        )
        .await
        .unwrap();
    assert_eq!(stack.queue.get_messages("carol", None).len(), 1);

    // carol connects and joins
    let (carol, mut carol_rx) = stack.gate.open_session_for_test(user("carol"));
    join(&stack, &carol).await;

    let frames = drain(&mut carol_rx);
    let queued: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|f| f["event"] == "queued-notifications")
        .collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["payload"]["messages"].as_array().unwrap().len(), 1);

    // leaving and rejoining does not resend
    stack
        .gate
        .handle_event(
            &carol,
            ClientEvent::LeaveProject(JoinProjectPayload {
                project_id: "P1".to_string(),
                text_id: Some("T1".to_string()),
            }),
        )
        .await;
    join(&stack, &carol).await;
    let frames = drain(&mut carol_rx);
    assert!(!names(&frames).contains(&"queued-notifications".to_string()));
}

#[tokio::test]
async fn test_rate_limit_kicks_in_at_budget() {
    // REQUIREMENT: Events beyond the sliding-window budget fail with
    // RATE_LIMIT_ERROR and are not applied
    // PURPOSE: Verify the limiter sits in front of every handler

    let stack = stack().await;
    let (alice, mut alice_rx) = stack.gate.open_session_for_test(user("alice"));
    // join directly so the whole event budget is available for cursor traffic
    stack
        .rooms
        .join(
            alice.id,
            "alice",
            "alice",
            RoomMetadata::new("P1", Some("T1")),
        )
        .await
        .unwrap();

    for position in 0..101usize {
        stack
            .gate
            .handle_event(
                &alice,
                ClientEvent::CursorPosition(CursorPositionPayload {
                    room_id: ROOM.to_string(),
                    position,
                    text_id: "T1".to_string(),
                }),
            )
            .await;
    }

    let frames = drain(&mut alice_rx);
    let errors: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|f| f.get("error").is_some_and(|e| *e == serde_json::json!(true)))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "RATE_LIMIT_ERROR");
}

#[tokio::test]
async fn test_validation_errors_reach_originator_only() {
    // REQUIREMENT: Validation failures are surfaced to the originating session
    // only and do not affect room state
    // PURPOSE: Verify the error propagation policy

    let stack = stack().await;
    let (alice, mut alice_rx) = stack.gate.open_session_for_test(user("alice"));
    let (bob, mut bob_rx) = stack.gate.open_session_for_test(user("bob"));
    join(&stack, &alice).await;
    join(&stack, &bob).await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    // inverted offsets fail validation
    let draft = serde_json::from_value(serde_json::json!({
        "localId": "L1",
        "textId": "T1",
        "startOffset": 30,
        "endOffset": 10,
        "text": "x",
        "labels": ["L_k"],
    }))
    .unwrap();
    stack
        .gate
        .handle_event(
            &alice,
            ClientEvent::AnnotationCreate(AnnotationCreatePayload {
                annotation: draft,
                room_id: ROOM.to_string(),
            }),
        )
        .await;

    let alice_frames = drain(&mut alice_rx);
    assert!(alice_frames
        .iter()
        .any(|f| f.get("code").is_some_and(|c| *c == serde_json::json!("VALIDATION_ERROR"))));
    assert!(drain(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn test_join_denied_without_project_access() {
    // REQUIREMENT: 2xx on the access check allows a join; 4xx rejects it
    // PURPOSE: Verify the authorization hop in the join flow

    let mut rest = mockito::Server::new_async().await;
    rest.mock("GET", "/api/projects/P9/access/alice")
        .with_status(403)
        .expect_at_least(1)
        .create_async()
        .await;
    let stack = assemble(rest);

    let (alice, mut alice_rx) = stack.gate.open_session_for_test(user("alice"));
    stack
        .gate
        .handle_event(
            &alice,
            ClientEvent::JoinProject(JoinProjectPayload {
                project_id: "P9".to_string(),
                text_id: None,
            }),
        )
        .await;

    let frames = drain(&mut alice_rx);
    assert!(frames
        .iter()
        .any(|f| f.get("code").is_some_and(|c| *c == serde_json::json!("AUTHZ_ERROR"))));
    assert!(!stack.rooms.is_member("project:P9", "alice"));
}

#[tokio::test]
async fn test_leave_announces_and_cleans_membership() {
    // REQUIREMENT: Leaving a room removes membership and tells the peers
    // PURPOSE: Verify the leave slice of the disconnect cascade

    let stack = stack().await;
    let (alice, mut alice_rx) = stack.gate.open_session_for_test(user("alice"));
    let (bob, mut bob_rx) = stack.gate.open_session_for_test(user("bob"));
    join(&stack, &alice).await;
    join(&stack, &bob).await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    stack
        .gate
        .handle_event(
            &bob,
            ClientEvent::LeaveProject(JoinProjectPayload {
                project_id: "P1".to_string(),
                text_id: Some("T1".to_string()),
            }),
        )
        .await;

    let alice_names = names(&drain(&mut alice_rx));
    assert!(alice_names.contains(&"user-left".to_string()));
    assert!(!stack.rooms.is_member(ROOM, "bob"));

    let room = stack.rooms.get_room(ROOM).unwrap();
    assert_eq!(room.members.len(), 1);
}

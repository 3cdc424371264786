/**
 * REQUIREMENT: Categorized, templated notifications delivered to subscribed
 * users; offline recipients are queued and flushed once on reconnection
 * PURPOSE: The notification catalogue, subscription filter, and delivery paths
 */
use chrono::Utc;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::models::events::{
    NotificationPayload, QueuedNotificationsPayload, ServerEvent,
};
use crate::models::message::MessagePriority;
use crate::models::notification::{
    interpolate, Notification, NotificationRequest, NotificationTemplate,
};
use crate::services::queue::MessageQueue;
use crate::services::room_manager::RoomManager;

const HISTORY_CAP: usize = 500;
const HISTORY_MAX_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Fixed catalogue: notification type -> rendered fields
static TEMPLATES: Lazy<HashMap<&'static str, NotificationTemplate>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "annotation-created",
        NotificationTemplate {
            title: "New annotation",
            message: "{username} annotated \"{text}\"",
            icon: "highlight",
            priority: MessagePriority::Normal,
            category: "annotations",
        },
    );
    map.insert(
        "annotation-conflict",
        NotificationTemplate {
            title: "Annotation conflict",
            message: "{username}'s annotation conflicts with {count} other(s)",
            icon: "warning",
            priority: MessagePriority::High,
            category: "conflicts",
        },
    );
    map.insert(
        "conflict-resolved",
        NotificationTemplate {
            title: "Conflict resolved",
            message: "A conflict was resolved using {strategy}",
            icon: "check",
            priority: MessagePriority::Normal,
            category: "conflicts",
        },
    );
    map.insert(
        "comment-added",
        NotificationTemplate {
            title: "New comment",
            message: "{username} commented on an annotation",
            icon: "comment",
            priority: MessagePriority::Normal,
            category: "comments",
        },
    );
    map.insert(
        "user-joined",
        NotificationTemplate {
            title: "User joined",
            message: "{username} joined the project",
            icon: "person",
            priority: MessagePriority::Low,
            category: "presence",
        },
    );
    map.insert(
        "mention",
        NotificationTemplate {
            title: "You were mentioned",
            message: "{username} mentioned you: {excerpt}",
            icon: "alternate_email",
            priority: MessagePriority::High,
            category: "mentions",
        },
    );
    map.insert(
        "system",
        NotificationTemplate {
            title: "System notice",
            message: "{message}",
            icon: "info",
            priority: MessagePriority::Normal,
            category: "system",
        },
    );
    map
});

pub struct NotificationDispatcher {
    rooms: Arc<RoomManager>,
    queue: Arc<MessageQueue>,
    /// user id -> subscription tokens (types, categories, "all", "none")
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    user_history: RwLock<HashMap<String, VecDeque<Notification>>>,
    room_history: RwLock<HashMap<String, VecDeque<Notification>>>,
    /// user id -> ids of notifications they have read
    read_state: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl NotificationDispatcher {
    pub fn new(rooms: Arc<RoomManager>, queue: Arc<MessageQueue>) -> Self {
        Self {
            rooms,
            queue,
            subscriptions: RwLock::new(HashMap::new()),
            user_history: RwLock::new(HashMap::new()),
            room_history: RwLock::new(HashMap::new()),
            read_state: RwLock::new(HashMap::new()),
        }
    }

    /// Render a request through the catalogue; unknown types still send with
    /// the caller-provided fields only
    pub fn render(&self, request: &NotificationRequest, room_id: &str, sender_id: &str) -> Notification {
        let template = TEMPLATES.get(request.notification_type.as_str());
        let (title, message, icon, priority, category) = match template {
            Some(t) => (
                request
                    .title
                    .clone()
                    .unwrap_or_else(|| interpolate(t.title, &request.data)),
                request
                    .message
                    .clone()
                    .unwrap_or_else(|| interpolate(t.message, &request.data)),
                Some(t.icon.to_string()),
                request.priority.unwrap_or(t.priority),
                t.category.to_string(),
            ),
            None => (
                request.title.clone().unwrap_or_default(),
                request.message.clone().unwrap_or_default(),
                None,
                request.priority.unwrap_or_default(),
                "general".to_string(),
            ),
        };
        Notification {
            id: Uuid::new_v4(),
            notification_type: request.notification_type.clone(),
            category,
            title,
            message,
            icon,
            priority,
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            created_at: Utc::now(),
            data: request.data.clone(),
        }
    }

    /// A user is subscribed to type T in category C iff their set contains
    /// T, C, or "all", and does not contain "none". No set means subscribed.
    pub fn is_subscribed(&self, user_id: &str, notification_type: &str, category: &str) -> bool {
        let subscriptions = self.subscriptions.read().unwrap();
        match subscriptions.get(user_id) {
            None => true,
            Some(set) => {
                !set.contains("none")
                    && (set.contains(notification_type)
                        || set.contains(category)
                        || set.contains("all"))
            }
        }
    }

    pub fn subscribe(&self, user_id: &str, categories: &[String]) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        let set = subscriptions.entry(user_id.to_string()).or_default();
        set.remove("none");
        set.extend(categories.iter().cloned());
    }

    pub fn unsubscribe(&self, user_id: &str, categories: &[String]) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        let set = subscriptions.entry(user_id.to_string()).or_default();
        for category in categories {
            set.remove(category);
        }
        if set.is_empty() {
            set.insert("none".to_string());
        }
    }

    /// Deliver a notification: targeted users get per-user delivery with
    /// offline queueing; no target set means a whole-room broadcast
    pub async fn send(
        &self,
        room_id: &str,
        request: &NotificationRequest,
        target_users: Option<&HashSet<String>>,
        sender_id: &str,
    ) -> CollabResult<Notification> {
        let notification = self.render(request, room_id, sender_id);
        self.record_room_history(&notification);
        crate::metrics::record_notification(&notification.category);

        match target_users {
            Some(targets) => {
                for user_id in targets {
                    if !self.is_subscribed(
                        user_id,
                        &notification.notification_type,
                        &notification.category,
                    ) {
                        continue;
                    }
                    self.record_user_history(user_id, &notification);
                    let frame = ServerEvent::Notification(NotificationPayload {
                        room_id: room_id.to_string(),
                        notification: notification.clone(),
                    })
                    .into();
                    if self.rooms.is_user_online(user_id) {
                        self.rooms.send_to_user_sessions(user_id, &frame);
                    } else {
                        debug!("queueing notification for offline user {}", user_id);
                        self.queue.enqueue_user(
                            user_id,
                            "notification",
                            serde_json::to_value(&notification)?,
                            notification.priority,
                        )?;
                    }
                }
            }
            None => {
                self.rooms
                    .broadcast(
                        room_id,
                        &ServerEvent::Notification(NotificationPayload {
                            room_id: room_id.to_string(),
                            notification: notification.clone(),
                        })
                        .into(),
                        None,
                    )
                    .await;
            }
        }
        Ok(notification)
    }

    /// Flush a reconnecting user's queued notifications in one frame, then
    /// mark them delivered so a later join does not resend them
    pub fn flush_queued(
        &self,
        session_id: Uuid,
        user_id: &str,
        room_id: &str,
    ) -> CollabResult<usize> {
        let messages = self.queue.get_messages(user_id, Some(room_id));
        if messages.is_empty() {
            return Ok(0);
        }
        let count = messages.len();
        let frame = ServerEvent::QueuedNotifications(QueuedNotificationsPayload {
            messages: messages.clone(),
        })
        .into();
        if !self.rooms.send_to_session(session_id, frame) {
            return Err(CollabError::Notification(format!(
                "session {} is gone",
                session_id
            )));
        }
        for message in &messages {
            self.queue.mark_delivered(message.id, user_id)?;
        }
        debug!("flushed {} queued messages to {}", count, user_id);
        Ok(count)
    }

    pub fn mark_read(&self, notification_id: Uuid, user_id: &str) {
        self.read_state
            .write()
            .unwrap()
            .entry(user_id.to_string())
            .or_default()
            .insert(notification_id);
    }

    /// A user's notification history, optionally unread-only or per category
    pub fn list(
        &self,
        user_id: &str,
        unread_only: bool,
        category: Option<&str>,
    ) -> Vec<Notification> {
        let read = self.read_state.read().unwrap();
        let read_set = read.get(user_id);
        self.user_history
            .read()
            .unwrap()
            .get(user_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|n| {
                        (!unread_only || !read_set.is_some_and(|set| set.contains(&n.id)))
                            && category.map(|c| n.category == c).unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_history(&self, room_id: &str) -> Vec<Notification> {
        self.room_history
            .read()
            .unwrap()
            .get(room_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_user_history(&self, user_id: &str, notification: &Notification) {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(HISTORY_MAX_AGE_MS);
        let mut histories = self.user_history.write().unwrap();
        let history = histories.entry(user_id.to_string()).or_default();
        push_trimmed(history, notification.clone(), cutoff);
    }

    fn record_room_history(&self, notification: &Notification) {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(HISTORY_MAX_AGE_MS);
        let mut histories = self.room_history.write().unwrap();
        let history = histories.entry(notification.room_id.clone()).or_default();
        push_trimmed(history, notification.clone(), cutoff);
    }
}

fn push_trimmed(
    history: &mut VecDeque<Notification>,
    notification: Notification,
    cutoff: chrono::DateTime<Utc>,
) {
    history.push_back(notification);
    while history.len() > HISTORY_CAP {
        history.pop_front();
    }
    while history
        .front()
        .is_some_and(|n| n.created_at < cutoff)
    {
        history.pop_front();
    }
}

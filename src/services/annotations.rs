/**
 * REQUIREMENT: Validate and distribute annotation create/update/delete under a
 * per-annotation lock, transforming offsets and checking conflicts on the way
 * PURPOSE: The mutating annotation path every room peer observes
 */
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::models::AuthenticatedUser;
use crate::error::{CollabError, CollabResult};
use crate::models::annotation::{Annotation, AnnotationComment, AnnotationDraft};
use crate::models::conflict::Conflict;
use crate::models::events::{
    AnnotationConfirmPayload, AnnotationConflictPayload, AnnotationDeletedPayload,
    AnnotationEventPayload, CommentCreatedPayload, ServerEvent,
};
use crate::models::message::MessagePriority;
use crate::services::cluster::{ClusterAdapter, LockHandle, DEFAULT_LOCK_TTL};
use crate::services::conflict::ConflictResolver;
use crate::services::ot::OtEngine;
use crate::services::queue::MessageQueue;
use crate::services::room_manager::RoomManager;

/// Bounded retry budget for the per-annotation lock
const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

enum AnnotationLock {
    Cluster(LockHandle),
    Local(String),
}

pub struct AnnotationBroadcaster {
    rooms: Arc<RoomManager>,
    ot: Arc<OtEngine>,
    conflicts: Arc<ConflictResolver>,
    queue: Arc<MessageQueue>,
    cluster: Option<Arc<ClusterAdapter>>,
    /// room id -> annotation id -> cached annotation (for conflict checks)
    cache: RwLock<HashMap<String, HashMap<Uuid, Annotation>>>,
    /// best-effort local locks when no cluster adapter is configured
    local_locks: RwLock<HashMap<String, Instant>>,
}

impl AnnotationBroadcaster {
    pub fn new(
        rooms: Arc<RoomManager>,
        ot: Arc<OtEngine>,
        conflicts: Arc<ConflictResolver>,
        queue: Arc<MessageQueue>,
        cluster: Option<Arc<ClusterAdapter>>,
    ) -> Self {
        Self {
            rooms,
            ot,
            conflicts,
            queue,
            cluster,
            cache: RwLock::new(HashMap::new()),
            local_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Create an annotation: validate, lock, transform, conflict-check, fan out.
    /// The author gets a confirmation carrying their localId; peers get
    /// annotation-created; conflicts additionally raise annotation-conflict.
    pub async fn create(
        &self,
        session_id: Uuid,
        user: &AuthenticatedUser,
        room_id: &str,
        draft: AnnotationDraft,
    ) -> CollabResult<Annotation> {
        draft.validate_draft()?;
        self.require_membership(room_id, &user.id)?;

        let local_id = draft.local_id.clone();
        let annotation = draft.into_annotation(&user.id);
        let lock = self.acquire_lock(&annotation.id).await?;

        let result = self
            .admit(session_id, user, room_id, annotation, Some(local_id), false)
            .await;
        self.release_lock(lock).await;
        result
    }

    /// Update an annotation owned by the room's cache
    pub async fn update(
        &self,
        session_id: Uuid,
        user: &AuthenticatedUser,
        room_id: &str,
        mut annotation: Annotation,
    ) -> CollabResult<Annotation> {
        annotation.validate_range()?;
        self.require_membership(room_id, &user.id)?;

        let known = self
            .cache
            .read()
            .unwrap()
            .get(room_id)
            .is_some_and(|room| room.contains_key(&annotation.id));
        if !known {
            return Err(CollabError::Annotation(format!(
                "annotation {} is not in room {}",
                annotation.id, room_id
            )));
        }

        // moderators may edit anyone's annotations, authors their own
        let owner = self
            .cache
            .read()
            .unwrap()
            .get(room_id)
            .and_then(|room| room.get(&annotation.id))
            .map(|a| a.author_id.clone());
        if owner.as_deref() != Some(user.id.as_str()) && !user.can_moderate() {
            return Err(CollabError::Authorization(format!(
                "user {} cannot edit annotation {}",
                user.id, annotation.id
            )));
        }

        annotation.author_id = user.id.clone();
        annotation.updated_at = chrono::Utc::now();
        let lock = self.acquire_lock(&annotation.id).await?;
        let result = self
            .admit(session_id, user, room_id, annotation, None, true)
            .await;
        self.release_lock(lock).await;
        result
    }

    /// Delete an annotation and tell the room
    pub async fn delete(
        &self,
        session_id: Uuid,
        user: &AuthenticatedUser,
        room_id: &str,
        annotation_id: Uuid,
    ) -> CollabResult<()> {
        self.require_membership(room_id, &user.id)?;

        let lock = self.acquire_lock(&annotation_id).await?;
        let removed = {
            let mut cache = self.cache.write().unwrap();
            let removed = cache
                .get_mut(room_id)
                .and_then(|room| room.remove(&annotation_id));
            match &removed {
                Some(stored)
                    if stored.author_id != user.id && !user.can_moderate() =>
                {
                    // put it back; the caller may not delete someone else's work
                    cache
                        .get_mut(room_id)
                        .expect("room entry exists")
                        .insert(annotation_id, stored.clone());
                    None
                }
                _ => removed,
            }
        };
        self.release_lock(lock).await;

        let Some(removed) = removed else {
            return Err(CollabError::Annotation(format!(
                "annotation {} cannot be deleted from {}",
                annotation_id, room_id
            )));
        };

        info!("annotation {} deleted from {}", annotation_id, room_id);
        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::AnnotationDeleted(AnnotationDeletedPayload {
                    room_id: room_id.to_string(),
                    annotation_id: removed.id,
                    author: user.username.clone(),
                })
                .into(),
                Some(session_id),
            )
            .await;
        Ok(())
    }

    /// Attach a discussion comment to an annotation and broadcast it
    pub async fn comment(
        &self,
        user: &AuthenticatedUser,
        room_id: &str,
        annotation_id: Uuid,
        content: String,
    ) -> CollabResult<AnnotationComment> {
        self.require_membership(room_id, &user.id)?;
        if content.trim().is_empty() {
            return Err(CollabError::Validation("comment is empty".to_string()));
        }
        let known = self
            .cache
            .read()
            .unwrap()
            .get(room_id)
            .is_some_and(|room| room.contains_key(&annotation_id));
        if !known {
            return Err(CollabError::Annotation(format!(
                "annotation {} is not in room {}",
                annotation_id, room_id
            )));
        }

        let comment = AnnotationComment::new(annotation_id, &user.id, content);
        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::CommentCreated(CommentCreatedPayload {
                    room_id: room_id.to_string(),
                    comment: comment.clone(),
                    author: user.username.clone(),
                })
                .into(),
                None,
            )
            .await;
        Ok(comment)
    }

    /// Cached annotations for a room (room-state snapshots, conflict checks)
    pub fn room_annotations(&self, room_id: &str) -> Vec<Annotation> {
        self.cache
            .read()
            .unwrap()
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cleanup_room(&self, room_id: &str) {
        self.cache.write().unwrap().remove(room_id);
    }

    // --- internals ---

    async fn admit(
        &self,
        session_id: Uuid,
        user: &AuthenticatedUser,
        room_id: &str,
        annotation: Annotation,
        local_id: Option<String>,
        is_update: bool,
    ) -> CollabResult<Annotation> {
        // rewrite offsets against edits the author had not seen
        let annotation = self.ot.transform_annotation(annotation, room_id);
        annotation.validate_range()?;

        let existing = self.room_annotations(room_id);
        let detected = self.conflicts.detect(&annotation, &existing, room_id);

        self.cache
            .write()
            .unwrap()
            .entry(room_id.to_string())
            .or_default()
            .insert(annotation.id, annotation.clone());

        let event = if is_update {
            ServerEvent::AnnotationUpdated(AnnotationEventPayload {
                room_id: room_id.to_string(),
                annotation: annotation.clone(),
                author: user.username.clone(),
            })
        } else {
            ServerEvent::AnnotationCreated(AnnotationEventPayload {
                room_id: room_id.to_string(),
                annotation: annotation.clone(),
                author: user.username.clone(),
            })
        };
        self.rooms
            .broadcast(room_id, &event.into(), Some(session_id))
            .await;

        if let Some(local_id) = local_id {
            self.rooms.send_to_session(
                session_id,
                ServerEvent::AnnotationCreatedConfirm(AnnotationConfirmPayload {
                    room_id: room_id.to_string(),
                    local_id,
                    annotation: annotation.clone(),
                })
                .into(),
            );
        }

        if !detected.is_empty() {
            self.raise_conflicts(room_id, &annotation, detected).await?;
        }
        Ok(annotation)
    }

    /// Neither annotation is discarded; the room hears about the clash and a
    /// resolution task lands on the room queue
    async fn raise_conflicts(
        &self,
        room_id: &str,
        annotation: &Annotation,
        detected: Vec<Conflict>,
    ) -> CollabResult<()> {
        debug!(
            "{} conflicts detected for annotation {} in {}",
            detected.len(),
            annotation.id,
            room_id
        );
        self.rooms
            .broadcast(
                room_id,
                &ServerEvent::AnnotationConflict(AnnotationConflictPayload {
                    room_id: room_id.to_string(),
                    conflicts: detected.clone(),
                    annotation: annotation.clone(),
                })
                .into(),
                None,
            )
            .await;

        self.queue.enqueue_room(
            room_id,
            "conflict-resolution",
            serde_json::json!({
                "roomId": room_id,
                "annotationId": annotation.id,
                "conflictIds": detected.iter().map(|c| c.id).collect::<Vec<_>>(),
            }),
            MessagePriority::High,
            Some(HashSet::new()),
        )?;
        Ok(())
    }

    fn require_membership(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        if self.rooms.is_member(room_id, user_id) {
            Ok(())
        } else {
            Err(CollabError::Authorization(format!(
                "user {} is not a member of room {}",
                user_id, room_id
            )))
        }
    }

    /// Per-annotation lock: distributed when the cluster adapter is up,
    /// best-effort local otherwise. Exhausting the retry budget is a Conflict
    /// the client should retry.
    async fn acquire_lock(&self, annotation_id: &Uuid) -> CollabResult<AnnotationLock> {
        let resource = format!("annotation:{}", annotation_id);
        for attempt in 0..LOCK_ATTEMPTS {
            match &self.cluster {
                Some(cluster) => {
                    match cluster.acquire_lock(&resource, DEFAULT_LOCK_TTL).await {
                        Ok(Some(handle)) => return Ok(AnnotationLock::Cluster(handle)),
                        Ok(None) => {}
                        // a degraded cluster store falls back to local locking
                        Err(_) => {
                            if self.try_local_lock(&resource) {
                                return Ok(AnnotationLock::Local(resource));
                            }
                        }
                    }
                }
                None => {
                    if self.try_local_lock(&resource) {
                        return Ok(AnnotationLock::Local(resource));
                    }
                }
            }
            if attempt + 1 < LOCK_ATTEMPTS {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
        }
        Err(CollabError::Conflict(format!(
            "annotation {} is locked by another edit, retry",
            annotation_id
        )))
    }

    fn try_local_lock(&self, resource: &str) -> bool {
        let mut locks = self.local_locks.write().unwrap();
        let now = Instant::now();
        locks.retain(|_, acquired| now.duration_since(*acquired) < DEFAULT_LOCK_TTL);
        if locks.contains_key(resource) {
            false
        } else {
            locks.insert(resource.to_string(), now);
            true
        }
    }

    async fn release_lock(&self, lock: AnnotationLock) {
        match lock {
            AnnotationLock::Cluster(handle) => {
                if let Some(cluster) = &self.cluster {
                    if let Err(e) = cluster.release_lock(&handle).await {
                        e.log_with_context("releasing annotation lock");
                    }
                }
            }
            AnnotationLock::Local(resource) => {
                self.local_locks.write().unwrap().remove(&resource);
            }
        }
    }
}

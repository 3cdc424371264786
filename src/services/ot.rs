/**
 * REQUIREMENT: Concurrent position-bearing operations are reordered so all
 * sites converge regardless of apply order; annotation offsets are rewritten
 * against the recent operation log
 * PURPOSE: The operational-transform engine, state vectors, and operation log
 *
 * Pair rules follow the convergence law: applying op1 then T(op2|op1) must
 * equal applying op2 then T(op1|op2). A delete spanning a concurrent interior
 * insert therefore transforms into a replace that re-emits the inserted text
 * rather than silently swallowing it.
 */
use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::debug;

use crate::error::{CollabError, CollabResult};
use crate::models::annotation::Annotation;
use crate::models::operation::{OperationEnvelope, StateVector, TextOperation};

/// Operation log cap per room; older entries are dropped
const LOG_CAP: usize = 1_000;
/// Annotation rewrites consider at most this many recent operations
const ANNOTATION_WINDOW_OPS: usize = 100;
/// ... and only operations younger than this
const ANNOTATION_WINDOW_MS: i64 = 60_000;
/// Memo cache safety valve
const CACHE_CAP: usize = 4_096;

type CacheKey = (TextOperation, TextOperation, bool);

#[derive(Default)]
struct RoomOtState {
    log: VecDeque<OperationEnvelope>,
    state_vector: StateVector,
    cache: HashMap<CacheKey, TextOperation>,
}

pub struct OtEngine {
    rooms: RwLock<HashMap<String, RoomOtState>>,
}

impl Default for OtEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OtEngine {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Transform an incoming operation against every recorded peer operation
    /// the author had not yet observed, then record it under a fresh
    /// per-author sequence number.
    pub fn transform_operation(
        &self,
        operation: TextOperation,
        observed_state: &StateVector,
        room_id: &str,
        text_id: &str,
        author_id: &str,
    ) -> CollabResult<OperationEnvelope> {
        if let TextOperation::Delete { length: 0, .. } = operation {
            return Err(CollabError::Transform("delete of length zero".to_string()));
        }

        let mut rooms = self.rooms.write().unwrap();
        let state = rooms.entry(room_id.to_string()).or_default();

        let mut transformed = operation;
        for recorded in state.log.iter() {
            if recorded.author_id == author_id || recorded.text_id != text_id {
                continue;
            }
            let seen = observed_state
                .get(&recorded.author_id)
                .copied()
                .unwrap_or(0);
            if recorded.sequence <= seen {
                continue;
            }
            transformed = transform_cached(
                &mut state.cache,
                transformed,
                author_id,
                &recorded.operation,
                &recorded.author_id,
            );
            if transformed.is_noop() {
                break;
            }
        }

        // strictly monotonic per-author counter
        let sequence = state
            .state_vector
            .get(author_id)
            .copied()
            .unwrap_or(0)
            + 1;
        state.state_vector.insert(author_id.to_string(), sequence);

        let mut envelope = OperationEnvelope::new(author_id, text_id, transformed);
        envelope.sequence = sequence;
        envelope.observed_state = state.state_vector.clone();

        state.log.push_back(envelope.clone());
        while state.log.len() > LOG_CAP {
            state.log.pop_front();
        }
        crate::metrics::record_transform();
        debug!(
            "recorded op seq {} by {} in {} (log {})",
            sequence,
            author_id,
            room_id,
            state.log.len()
        );
        Ok(envelope)
    }

    /// Rewrite annotation offsets against the recent operation log, bounded to
    /// the last 100 operations within the last minute
    pub fn transform_annotation(&self, mut annotation: Annotation, room_id: &str) -> Annotation {
        let rooms = self.rooms.read().unwrap();
        let Some(state) = rooms.get(room_id) else {
            return annotation;
        };
        let cutoff = Utc::now() - Duration::milliseconds(ANNOTATION_WINDOW_MS);
        let recent: Vec<&OperationEnvelope> = state
            .log
            .iter()
            .rev()
            .take(ANNOTATION_WINDOW_OPS)
            .filter(|env| env.timestamp >= cutoff)
            .collect();

        // walk oldest-first over the window
        for envelope in recent.into_iter().rev() {
            if envelope.text_id != annotation.text_id || envelope.author_id == annotation.author_id
            {
                continue;
            }
            let (start, end) = rewrite_range(
                annotation.start_offset,
                annotation.end_offset,
                &envelope.operation,
            );
            annotation.start_offset = start;
            annotation.end_offset = end;
        }
        annotation
    }

    /// Current state vector for a room (empty when the room has no log yet)
    pub fn state_vector(&self, room_id: &str) -> StateVector {
        self.rooms
            .read()
            .unwrap()
            .get(room_id)
            .map(|state| state.state_vector.clone())
            .unwrap_or_default()
    }

    pub fn log_len(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .unwrap()
            .get(room_id)
            .map(|state| state.log.len())
            .unwrap_or(0)
    }

    /// Drop the log, state vector, and memo cache of an evicted room
    pub fn cleanup_room(&self, room_id: &str) {
        self.rooms.write().unwrap().remove(room_id);
    }
}

fn transform_cached(
    cache: &mut HashMap<CacheKey, TextOperation>,
    op1: TextOperation,
    author1: &str,
    op2: &TextOperation,
    author2: &str,
) -> TextOperation {
    let key = (op1.clone(), op2.clone(), author1 <= author2);
    if let Some(hit) = cache.get(&key) {
        return hit.clone();
    }
    let result = transform_pair(&op1, author1, op2, author2);
    if cache.len() >= CACHE_CAP {
        cache.clear();
    }
    cache.insert(key, result.clone());
    result
}

/// Transform `op1` so it applies after `op2` has been applied
pub fn transform_pair(
    op1: &TextOperation,
    author1: &str,
    op2: &TextOperation,
    author2: &str,
) -> TextOperation {
    use TextOperation::*;

    match (op1, op2) {
        (Noop, _) => Noop,
        (_, Noop) => op1.clone(),

        // a replace on the other side acts as delete-then-insert
        (
            _,
            Replace {
                position: p2,
                text: t2,
                original_length: o2,
            },
        ) => {
            let after_delete = transform_pair(
                op1,
                author1,
                &Delete {
                    position: *p2,
                    length: *o2,
                },
                author2,
            );
            transform_pair(
                &after_delete,
                author1,
                &Insert {
                    position: *p2,
                    text: t2.clone(),
                },
                author2,
            )
        }

        // a replace on our side transforms through its delete component
        (
            Replace {
                position: p1,
                text: t1,
                original_length: o1,
            },
            _,
        ) => {
            let delete_part = transform_pair(
                &Delete {
                    position: *p1,
                    length: *o1,
                },
                author1,
                op2,
                author2,
            );
            match delete_part {
                Delete { position, length } => Replace {
                    position,
                    text: t1.clone(),
                    original_length: length,
                },
                // the replaced range vanished; only our insertion remains
                Noop => transform_pair(
                    &Insert {
                        position: *p1,
                        text: t1.clone(),
                    },
                    author1,
                    op2,
                    author2,
                ),
                // delete part absorbed a peer insert; keep both texts
                Replace {
                    position,
                    text: peer_text,
                    original_length,
                } => Replace {
                    position,
                    text: format!("{}{}", t1, peer_text),
                    original_length,
                },
                Insert { position, text } => Insert { position, text },
            }
        }

        (
            Insert {
                position: p1,
                text: t1,
            },
            Insert {
                position: p2,
                text: t2,
            },
        ) => {
            // ties break deterministically by author id ordering
            if p1 < p2 || (p1 == p2 && author1 <= author2) {
                op1.clone()
            } else {
                Insert {
                    position: p1 + t2.chars().count(),
                    text: t1.clone(),
                }
            }
        }

        (
            Insert {
                position: p1,
                text: t1,
            },
            Delete {
                position: p2,
                length: d2,
            },
        ) => {
            if p1 <= p2 {
                op1.clone()
            } else if *p1 <= p2 + d2 {
                Insert {
                    position: *p2,
                    text: t1.clone(),
                }
            } else {
                Insert {
                    position: p1 - d2,
                    text: t1.clone(),
                }
            }
        }

        (
            Delete {
                position: p1,
                length: d1,
            },
            Insert {
                position: p2,
                text: t2,
            },
        ) => {
            if p2 <= p1 {
                Delete {
                    position: p1 + t2.chars().count(),
                    length: *d1,
                }
            } else if *p2 < p1 + d1 {
                // the peer inserted strictly inside our range; removing the
                // whole span would destroy their text, so re-emit it
                Replace {
                    position: *p1,
                    text: t2.clone(),
                    original_length: d1 + t2.chars().count(),
                }
            } else {
                op1.clone()
            }
        }

        (
            Delete {
                position: p1,
                length: d1,
            },
            Delete {
                position: p2,
                length: d2,
            },
        ) => {
            let (e1, e2) = (p1 + d1, p2 + d2);
            if e2 <= *p1 {
                // peer removed a disjoint range before ours
                Delete {
                    position: p1 - d2,
                    length: *d1,
                }
            } else if *p2 >= e1 {
                // disjoint after ours
                op1.clone()
            } else if p2 <= p1 && e2 >= e1 {
                // peer swallowed our whole range
                Noop
            } else if p1 <= p2 && e1 >= e2 {
                // our range swallows the peer's
                if d1 == d2 {
                    Noop
                } else {
                    Delete {
                        position: *p1,
                        length: d1 - d2,
                    }
                }
            } else {
                // partial overlap collapses to (min start, d1 - overlap)
                let overlap = e1.min(e2) - p1.max(p2);
                let length = d1 - overlap;
                if length == 0 {
                    Noop
                } else {
                    Delete {
                        position: *p1.min(p2),
                        length,
                    }
                }
            }
        }
    }
}

/// Rewrite an annotation range [s, e) against an applied operation
pub fn rewrite_range(start: usize, end: usize, op: &TextOperation) -> (usize, usize) {
    use TextOperation::*;
    match op {
        Insert { position, text } => {
            let len = text.chars().count();
            if *position <= start {
                (start + len, end + len)
            } else if *position < end {
                (start, end + len)
            } else {
                (start, end)
            }
        }
        Delete { position, length } => {
            let shift = |offset: usize| {
                if position + length <= offset {
                    offset - length
                } else if *position <= offset {
                    *position
                } else {
                    offset
                }
            };
            (shift(start), shift(end))
        }
        Replace {
            position,
            text,
            original_length,
        } => {
            let (s, e) = rewrite_range(
                start,
                end,
                &Delete {
                    position: *position,
                    length: *original_length,
                },
            );
            rewrite_range(
                s,
                e,
                &Insert {
                    position: *position,
                    text: text.clone(),
                },
            )
        }
        Noop => (start, end),
    }
}

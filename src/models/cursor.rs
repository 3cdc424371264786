/**
 * REQUIREMENT: Per-(room, user, text) cursor and selection sharing
 * PURPOSE: Model cursor offsets, selection ranges, and the deterministic color palette
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::operation::TextOperation;

/// Fixed palette cycled deterministically; a user keeps one color per process lifetime
pub const CURSOR_COLORS: [&str; 10] = [
    "#1976d2", "#dc004e", "#2e7d32", "#ed6c02", "#9c27b0", "#00acc1", "#f57c00", "#5d4037",
    "#616161", "#0288d1",
];

/// First-touch color assignment from the palette
pub fn color_for_user(user_id: &str) -> &'static str {
    let hash = user_id
        .chars()
        .fold(0usize, |acc, c| acc.wrapping_add(c as usize));
    CURSOR_COLORS[hash % CURSOR_COLORS.len()]
}

/// A selection range [start, end] over a text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

impl SelectionRange {
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }
}

/// Cursor state for one (room, user, text)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub user_id: String,
    pub text_id: String,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    pub color: String,
    pub last_update: DateTime<Utc>,
}

impl CursorState {
    pub fn new(user_id: &str, text_id: &str, position: usize) -> Self {
        Self {
            user_id: user_id.to_string(),
            text_id: text_id.to_string(),
            position,
            selection: None,
            color: color_for_user(user_id).to_string(),
            last_update: Utc::now(),
        }
    }
}

/// Rewrite a cursor offset against a text operation
///
/// insert(pos, t): pos <= c shifts c right by |t|
/// delete(pos, d): ranges wholly before shift left; a cursor inside collapses to pos
/// replace is delete then insert at the same position
pub fn adjust_offset(offset: usize, op: &TextOperation) -> usize {
    match op {
        TextOperation::Insert { position, text } => {
            if *position <= offset {
                offset + text.chars().count()
            } else {
                offset
            }
        }
        TextOperation::Delete { position, length } => {
            if position + length <= offset {
                offset - length
            } else if *position <= offset {
                *position
            } else {
                offset
            }
        }
        TextOperation::Replace {
            position,
            text,
            original_length,
        } => {
            let deleted = adjust_offset(
                offset,
                &TextOperation::Delete {
                    position: *position,
                    length: *original_length,
                },
            );
            adjust_offset(
                deleted,
                &TextOperation::Insert {
                    position: *position,
                    text: text.clone(),
                },
            )
        }
        TextOperation::Noop => offset,
    }
}

/// Rewrite a selection as two cursor rewrites; invalid results are dropped
pub fn adjust_selection(selection: SelectionRange, op: &TextOperation) -> Option<SelectionRange> {
    let adjusted = SelectionRange {
        start: adjust_offset(selection.start, op),
        end: adjust_offset(selection.end, op),
    };
    adjusted.is_valid().then_some(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable_per_user() {
        // REQUIREMENT: The same user keeps the same color within a process lifetime
        // PURPOSE: Verify first-touch color assignment is deterministic

        let c1 = color_for_user("alice");
        let c2 = color_for_user("alice");
        assert_eq!(c1, c2);
        assert!(c1.starts_with('#'));
        assert_eq!(c1.len(), 7);
    }

    #[test]
    fn test_insert_before_cursor_shifts_right() {
        // REQUIREMENT: insert(pos, t) with pos <= c moves the cursor by |t|
        // PURPOSE: Verify the cursor rewrite that keeps remote carets anchored

        let op = TextOperation::Insert {
            position: 30,
            text: "XYZ".to_string(),
        };
        assert_eq!(adjust_offset(50, &op), 53);
        assert_eq!(adjust_offset(30, &op), 33);
        assert_eq!(adjust_offset(10, &op), 10);
    }

    #[test]
    fn test_delete_rewrites() {
        let op = TextOperation::Delete {
            position: 10,
            length: 5,
        };
        // wholly before the cursor
        assert_eq!(adjust_offset(20, &op), 15);
        // cursor inside the deleted range collapses to the delete start
        assert_eq!(adjust_offset(12, &op), 10);
        // cursor before the range is untouched
        assert_eq!(adjust_offset(5, &op), 5);
        // boundary: pos + d == c shifts fully
        assert_eq!(adjust_offset(15, &op), 10);
    }

    #[test]
    fn test_replace_applies_delete_then_insert() {
        let op = TextOperation::Replace {
            position: 10,
            text: "ab".to_string(),
            original_length: 5,
        };
        // cursor past the replaced range: -5 then +2
        assert_eq!(adjust_offset(20, &op), 17);
        // cursor inside the replaced range collapses then shifts with the insert
        assert_eq!(adjust_offset(12, &op), 12);
    }

    #[test]
    fn test_selection_rewrite_and_drop() {
        // REQUIREMENT: Selections are rewritten as two cursor rewrites and re-validated
        // PURPOSE: Verify selection adjustment keeps start <= end or drops the range

        let op = TextOperation::Delete {
            position: 0,
            length: 10,
        };
        let sel = SelectionRange { start: 15, end: 25 };
        assert_eq!(
            adjust_selection(sel, &op),
            Some(SelectionRange { start: 5, end: 15 })
        );

        let inside = SelectionRange { start: 2, end: 8 };
        assert_eq!(
            adjust_selection(inside, &op),
            Some(SelectionRange { start: 0, end: 0 })
        );
    }
}

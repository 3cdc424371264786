/**
 * REQUIREMENT: Position-bearing text operations for concurrent editing
 * PURPOSE: Model insert/delete/replace primitives exchanged between collaborators
 * These are the units the transform engine reorders so all sites converge
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CollabError, CollabResult};

/// A single text mutation primitive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TextOperation {
    Insert {
        position: usize,
        text: String,
    },
    Delete {
        position: usize,
        length: usize,
    },
    #[serde(rename_all = "camelCase")]
    Replace {
        position: usize,
        text: String,
        original_length: usize,
    },
    Noop,
}

impl TextOperation {
    pub fn is_noop(&self) -> bool {
        matches!(self, TextOperation::Noop)
    }

    /// Position the operation applies at; `None` for noop
    pub fn position(&self) -> Option<usize> {
        match self {
            TextOperation::Insert { position, .. }
            | TextOperation::Delete { position, .. }
            | TextOperation::Replace { position, .. } => Some(*position),
            TextOperation::Noop => None,
        }
    }

    /// Net change in document length after applying this operation
    pub fn length_delta(&self) -> i64 {
        match self {
            TextOperation::Insert { text, .. } => text.chars().count() as i64,
            TextOperation::Delete { length, .. } => -(*length as i64),
            TextOperation::Replace {
                text,
                original_length,
                ..
            } => text.chars().count() as i64 - *original_length as i64,
            TextOperation::Noop => 0,
        }
    }

    /// Validate shape invariants against a document length
    pub fn validate(&self, document_len: usize) -> CollabResult<()> {
        match self {
            TextOperation::Insert { position, .. } => {
                // Inserting at |document| appends, so the bound is inclusive
                if *position > document_len {
                    return Err(CollabError::Validation(format!(
                        "insert position {} exceeds document length {}",
                        position, document_len
                    )));
                }
            }
            TextOperation::Delete { position, length } => {
                if *length == 0 {
                    return Err(CollabError::Validation(
                        "delete length must be positive".to_string(),
                    ));
                }
                if position + length > document_len {
                    return Err(CollabError::Validation(format!(
                        "delete range [{}, {}) exceeds document length {}",
                        position,
                        position + length,
                        document_len
                    )));
                }
            }
            TextOperation::Replace {
                position,
                original_length,
                ..
            } => {
                if position + original_length > document_len {
                    return Err(CollabError::Validation(format!(
                        "replace range [{}, {}) exceeds document length {}",
                        position,
                        position + original_length,
                        document_len
                    )));
                }
            }
            TextOperation::Noop => {}
        }
        Ok(())
    }

    /// Apply the operation to a document string (test and cache support)
    pub fn apply(&self, document: &str) -> CollabResult<String> {
        let chars: Vec<char> = document.chars().collect();
        self.validate(chars.len())?;
        match self {
            TextOperation::Insert { position, text } => {
                let mut out: String = chars[..*position].iter().collect();
                out.push_str(text);
                out.extend(&chars[*position..]);
                Ok(out)
            }
            TextOperation::Delete { position, length } => {
                let mut out: String = chars[..*position].iter().collect();
                out.extend(&chars[position + length..]);
                Ok(out)
            }
            TextOperation::Replace {
                position,
                text,
                original_length,
            } => {
                let mut out: String = chars[..*position].iter().collect();
                out.push_str(text);
                out.extend(&chars[position + original_length..]);
                Ok(out)
            }
            TextOperation::Noop => Ok(document.to_string()),
        }
    }
}

/// State vector: last sequence number observed per author
pub type StateVector = HashMap<String, u64>;

/// An operation as carried on the wire and recorded in the room log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEnvelope {
    pub id: uuid::Uuid,
    pub author_id: String,
    pub text_id: String,
    /// Per-author monotonically increasing counter assigned by the server
    #[serde(default)]
    pub sequence: u64,
    /// The last server sequences the client had observed when it emitted the op
    #[serde(default)]
    pub observed_state: StateVector,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub operation: TextOperation,
}

impl OperationEnvelope {
    pub fn new(author_id: &str, text_id: &str, operation: TextOperation) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            author_id: author_id.to_string(),
            text_id: text_id.to_string(),
            sequence: 0,
            observed_state: StateVector::new(),
            timestamp: Utc::now(),
            operation,
        }
    }
}

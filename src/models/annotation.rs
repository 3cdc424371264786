/**
 * REQUIREMENT: Annotation records exchanged between collaborating annotators
 * PURPOSE: Model the text-anchored annotations, their drafts, and comments
 * The canonical store lives in the REST API; these are the wire and cache shapes
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

use crate::error::{CollabError, CollabResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    Draft,
    Pending,
    Validated,
    Rejected,
}

impl Default for AnnotationStatus {
    fn default() -> Self {
        AnnotationStatus::Draft
    }
}

/// A text annotation anchored at [start_offset, end_offset)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: Uuid,
    pub text_id: String,
    pub author_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// The substring covered at creation time
    pub text: String,
    pub labels: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: AnnotationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Unknown wire fields preserved for forward compatibility
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Annotation {
    pub fn range_len(&self) -> usize {
        self.end_offset.saturating_sub(self.start_offset)
    }

    /// Non-empty intersection length with another annotation's range
    pub fn overlap_with(&self, other: &Annotation) -> usize {
        let start = self.start_offset.max(other.start_offset);
        let end = self.end_offset.min(other.end_offset);
        end.saturating_sub(start)
    }

    /// Offset ordering invariant: 0 <= start <= end
    pub fn validate_range(&self) -> CollabResult<()> {
        if self.start_offset > self.end_offset {
            return Err(CollabError::Validation(format!(
                "annotation range [{}, {}) is inverted",
                self.start_offset, self.end_offset
            )));
        }
        Ok(())
    }
}

/// Client-submitted annotation payload before the server assigns an id
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDraft {
    /// Client-chosen id echoed back in the confirmation so optimistic UI can reconcile
    #[validate(length(min = 1, max = 128))]
    pub local_id: String,
    #[validate(length(min = 1, max = 256))]
    pub text_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub text: String,
    pub labels: BTreeSet<String>,
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AnnotationDraft {
    /// Shape validation beyond the derive-level field checks
    pub fn validate_draft(&self) -> CollabResult<()> {
        self.validate()?;
        if self.start_offset > self.end_offset {
            return Err(CollabError::Validation(format!(
                "annotation range [{}, {}) is inverted",
                self.start_offset, self.end_offset
            )));
        }
        if self.labels.is_empty() {
            return Err(CollabError::Validation(
                "annotation requires at least one label".to_string(),
            ));
        }
        Ok(())
    }

    /// Promote a validated draft to a server-owned annotation
    pub fn into_annotation(self, author_id: &str) -> Annotation {
        let now = Utc::now();
        Annotation {
            id: Uuid::new_v4(),
            text_id: self.text_id,
            author_id: author_id.to_string(),
            start_offset: self.start_offset,
            end_offset: self.end_offset,
            text: self.text,
            labels: self.labels,
            confidence: self.confidence,
            notes: self.notes,
            status: AnnotationStatus::Draft,
            created_at: now,
            updated_at: now,
            extra: self.extra,
        }
    }
}

/// A discussion comment attached to an annotation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationComment {
    pub id: Uuid,
    pub annotation_id: Uuid,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl AnnotationComment {
    pub fn new(annotation_id: Uuid, author_id: &str, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            annotation_id,
            author_id: author_id.to_string(),
            content,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(start: usize, end: usize, labels: &[&str]) -> AnnotationDraft {
        AnnotationDraft {
            local_id: "L1".to_string(),
            text_id: "T1".to_string(),
            start_offset: start,
            end_offset: end,
            text: "machine lear".to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            confidence: None,
            notes: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_draft_validation() {
        // REQUIREMENT: Annotation payloads are validated before broadcast
        // PURPOSE: Verify offset ordering and label presence checks
        // Malformed payloads must never reach room peers

        assert!(draft(10, 20, &["L_k"]).validate_draft().is_ok());
        assert!(draft(20, 10, &["L_k"]).validate_draft().is_err());
        assert!(draft(10, 20, &[]).validate_draft().is_err());
    }

    #[test]
    fn test_confidence_bounds() {
        let mut d = draft(10, 20, &["L_k"]);
        d.confidence = Some(1.5);
        assert!(d.validate_draft().is_err());
        d.confidence = Some(0.9);
        assert!(d.validate_draft().is_ok());
    }

    #[test]
    fn test_overlap_computation() {
        // REQUIREMENT: Conflict detection needs the intersection of annotation ranges
        // PURPOSE: Verify overlap arithmetic for the detector

        let a = draft(100, 130, &["positive"]).into_annotation("alice");
        let b = draft(120, 150, &["negative"]).into_annotation("bob");
        assert_eq!(a.overlap_with(&b), 10);
        assert_eq!(b.overlap_with(&a), 10);

        let c = draft(200, 210, &["x"]).into_annotation("carol");
        assert_eq!(a.overlap_with(&c), 0);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        // REQUIREMENT: Unknown payload fields are preserved as opaque blobs
        // PURPOSE: Verify forward compatibility of the annotation wire schema

        let raw = serde_json::json!({
            "localId": "L9",
            "textId": "T1",
            "startOffset": 1,
            "endOffset": 4,
            "text": "abc",
            "labels": ["L_k"],
            "clientVersion": "2.4.1"
        });
        let d: AnnotationDraft = serde_json::from_value(raw).unwrap();
        assert_eq!(d.extra["clientVersion"], "2.4.1");

        let ann = d.into_annotation("alice");
        let back = serde_json::to_value(&ann).unwrap();
        assert_eq!(back["clientVersion"], "2.4.1");
    }
}

/**
 * REQUIREMENT: Conflict records for incompatible annotations on the same text
 * PURPOSE: Model the four conflict kinds, severities, and resolution outcomes
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::annotation::Annotation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    PositionOverlap,
    ContentConflict,
    LabelConflict,
    TemporalConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Detected,
    Resolved,
}

/// Resolution strategies the resolver can apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    FirstWriteWins,
    MergeAnnotations,
    UserPriority,
    ConfidenceBased,
    ManualResolution,
    VotingBased,
}

/// What a strategy did with the conflicting annotations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ResolutionAction {
    /// One annotation kept, the rest discarded
    KeptAnnotation { winner_id: Uuid },
    /// A single merged annotation replaces the inputs
    Merged { merged: Annotation },
    /// No state change; a human has to decide
    RequiresInput,
}

/// The recorded outcome attached to a resolved conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    #[serde(flatten)]
    pub action: ResolutionAction,
    pub resolved_at: DateTime<Utc>,
    pub resolved_by: Option<String>,
}

/// A detected incompatibility between annotations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: Uuid,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub annotations: Vec<Annotation>,
    pub room_id: String,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        annotations: Vec<Annotation>,
        room_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conflict_type,
            severity,
            annotations,
            room_id: room_id.to_string(),
            detected_at: Utc::now(),
            status: ConflictStatus::Detected,
            resolution: None,
        }
    }

    /// A resolved conflict names exactly one strategy and the action taken
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.status = ConflictStatus::Resolved;
        self.resolution = Some(resolution);
    }
}

/**
 * REQUIREMENT: Detect overlap/content/label/temporal conflicts between
 * annotations and apply a configurable resolution strategy
 * PURPOSE: The conflict detector, the strategy implementations, and per-room
 * conflict metrics
 */
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::models::annotation::Annotation;
use crate::models::conflict::{
    Conflict, ConflictResolution, ConflictSeverity, ConflictStatus, ConflictType,
    ResolutionAction, ResolutionStrategy,
};

/// Two edits by distinct authors on the same annotation within this window
/// count as a temporal conflict
const TEMPORAL_WINDOW_MS: i64 = 5_000;

/// Default adjacency list of mutually exclusive labels
fn default_conflicting_labels() -> Vec<(String, String)> {
    [
        ("positive", "negative"),
        ("relevant", "irrelevant"),
        ("correct", "incorrect"),
    ]
    .iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect()
}

/// Inputs some strategies need from the caller
#[derive(Debug, Default, Clone)]
pub struct ResolutionContext {
    /// user id -> priority value (higher wins)
    pub priorities: HashMap<String, i32>,
    /// annotation id -> vote count
    pub votes: HashMap<Uuid, u32>,
    pub resolved_by: Option<String>,
}

/// Per-room conflict counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMetrics {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub by_severity: HashMap<String, usize>,
    pub pending: usize,
    pub resolved: usize,
}

pub struct ConflictResolver {
    conflicting_labels: Vec<(String, String)>,
    /// room id -> detected conflicts
    conflicts: RwLock<HashMap<String, Vec<Conflict>>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            conflicting_labels: default_conflicting_labels(),
            conflicts: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_label_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            conflicting_labels: pairs,
            conflicts: RwLock::new(HashMap::new()),
        }
    }

    /// Detect all conflict kinds between a candidate and the room's annotations.
    /// Detected conflicts are recorded for the room and returned.
    pub fn detect(
        &self,
        candidate: &Annotation,
        existing: &[Annotation],
        room_id: &str,
    ) -> Vec<Conflict> {
        let mut detected = Vec::new();

        for other in existing {
            if other.id == candidate.id {
                // same record: only temporal conflicts apply
                if let Some(conflict) = self.detect_temporal(candidate, other, room_id) {
                    detected.push(conflict);
                }
                continue;
            }
            if other.text_id != candidate.text_id {
                continue;
            }

            let overlap = candidate.overlap_with(other);
            if overlap > 0 {
                detected.push(Conflict::new(
                    ConflictType::PositionOverlap,
                    overlap_severity(candidate, other, overlap),
                    vec![candidate.clone(), other.clone()],
                    room_id,
                ));

                if self.labels_conflict(&candidate.labels, &other.labels) {
                    detected.push(Conflict::new(
                        ConflictType::LabelConflict,
                        ConflictSeverity::High,
                        vec![candidate.clone(), other.clone()],
                        room_id,
                    ));
                }
            }

            if candidate.start_offset == other.start_offset
                && candidate.end_offset == other.end_offset
                && candidate.labels != other.labels
            {
                detected.push(Conflict::new(
                    ConflictType::ContentConflict,
                    ConflictSeverity::High,
                    vec![candidate.clone(), other.clone()],
                    room_id,
                ));
            }
        }

        if !detected.is_empty() {
            for conflict in &detected {
                crate::metrics::record_conflict(type_name(conflict.conflict_type));
            }
            self.conflicts
                .write()
                .unwrap()
                .entry(room_id.to_string())
                .or_default()
                .extend(detected.iter().cloned());
        }
        detected
    }

    fn detect_temporal(
        &self,
        candidate: &Annotation,
        stored: &Annotation,
        room_id: &str,
    ) -> Option<Conflict> {
        if candidate.author_id == stored.author_id {
            return None;
        }
        let gap = (candidate.updated_at - stored.updated_at)
            .num_milliseconds()
            .abs();
        (gap < TEMPORAL_WINDOW_MS).then(|| {
            Conflict::new(
                ConflictType::TemporalConflict,
                ConflictSeverity::Medium,
                vec![candidate.clone(), stored.clone()],
                room_id,
            )
        })
    }

    fn labels_conflict(&self, a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
        self.conflicting_labels.iter().any(|(left, right)| {
            (a.contains(left) && b.contains(right)) || (a.contains(right) && b.contains(left))
        })
    }

    /// Apply a strategy to a detected conflict; records and returns the outcome
    pub fn resolve(
        &self,
        conflict_id: Uuid,
        room_id: &str,
        strategy: ResolutionStrategy,
        context: &ResolutionContext,
    ) -> CollabResult<Conflict> {
        let mut conflicts = self.conflicts.write().unwrap();
        let conflict = conflicts
            .get_mut(room_id)
            .and_then(|list| list.iter_mut().find(|c| c.id == conflict_id))
            .ok_or_else(|| {
                CollabError::Conflict(format!("unknown conflict {} in {}", conflict_id, room_id))
            })?;

        let action = apply_strategy(strategy, &conflict.annotations, context)?;
        conflict.resolve(ConflictResolution {
            strategy,
            action,
            resolved_at: Utc::now(),
            resolved_by: context.resolved_by.clone(),
        });
        Ok(conflict.clone())
    }

    pub fn room_conflicts(&self, room_id: &str) -> Vec<Conflict> {
        self.conflicts
            .read()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Totals by type and severity, pending vs resolved
    pub fn metrics(&self, room_id: &str) -> ConflictMetrics {
        let conflicts = self.conflicts.read().unwrap();
        let mut metrics = ConflictMetrics::default();
        let Some(list) = conflicts.get(room_id) else {
            return metrics;
        };
        metrics.total = list.len();
        for conflict in list {
            *metrics
                .by_type
                .entry(type_name(conflict.conflict_type).to_string())
                .or_default() += 1;
            *metrics
                .by_severity
                .entry(severity_name(conflict.severity).to_string())
                .or_default() += 1;
            match conflict.status {
                ConflictStatus::Detected => metrics.pending += 1,
                ConflictStatus::Resolved => metrics.resolved += 1,
            }
        }
        metrics
    }

    pub fn cleanup_room(&self, room_id: &str) {
        self.conflicts.write().unwrap().remove(room_id);
    }
}

/// Highest severity among detected conflicts
pub fn max_severity(conflicts: &[Conflict]) -> Option<ConflictSeverity> {
    conflicts.iter().map(|c| c.severity).max()
}

fn overlap_severity(a: &Annotation, b: &Annotation, overlap: usize) -> ConflictSeverity {
    let smaller = a.range_len().min(b.range_len()).max(1);
    let fraction = overlap as f64 / smaller as f64;
    if fraction > 0.8 {
        ConflictSeverity::High
    } else if fraction > 0.5 {
        ConflictSeverity::Medium
    } else {
        ConflictSeverity::Low
    }
}

fn type_name(conflict_type: ConflictType) -> &'static str {
    match conflict_type {
        ConflictType::PositionOverlap => "position-overlap",
        ConflictType::ContentConflict => "content-conflict",
        ConflictType::LabelConflict => "label-conflict",
        ConflictType::TemporalConflict => "temporal-conflict",
    }
}

fn severity_name(severity: ConflictSeverity) -> &'static str {
    match severity {
        ConflictSeverity::Low => "low",
        ConflictSeverity::Medium => "medium",
        ConflictSeverity::High => "high",
        ConflictSeverity::Critical => "critical",
    }
}

fn apply_strategy(
    strategy: ResolutionStrategy,
    annotations: &[Annotation],
    context: &ResolutionContext,
) -> CollabResult<ResolutionAction> {
    if annotations.is_empty() {
        return Err(CollabError::Conflict(
            "conflict has no annotations to resolve".to_string(),
        ));
    }
    let action = match strategy {
        ResolutionStrategy::LastWriteWins => keep(annotations
            .iter()
            .max_by_key(|a| a.updated_at)
            .expect("non-empty")),
        ResolutionStrategy::FirstWriteWins => keep(annotations
            .iter()
            .min_by_key(|a| a.created_at)
            .expect("non-empty")),
        ResolutionStrategy::MergeAnnotations => ResolutionAction::Merged {
            merged: merge_annotations(annotations),
        },
        ResolutionStrategy::UserPriority => keep(annotations
            .iter()
            .max_by_key(|a| context.priorities.get(&a.author_id).copied().unwrap_or(0))
            .expect("non-empty")),
        ResolutionStrategy::ConfidenceBased => keep(annotations
            .iter()
            .max_by(|a, b| {
                a.confidence
                    .unwrap_or(0.0)
                    .total_cmp(&b.confidence.unwrap_or(0.0))
            })
            .expect("non-empty")),
        ResolutionStrategy::ManualResolution => ResolutionAction::RequiresInput,
        ResolutionStrategy::VotingBased => keep(annotations
            .iter()
            .max_by(|a, b| {
                let va = context.votes.get(&a.id).copied().unwrap_or(0);
                let vb = context.votes.get(&b.id).copied().unwrap_or(0);
                // ties broken by the latest edit
                va.cmp(&vb).then(a.updated_at.cmp(&b.updated_at))
            })
            .expect("non-empty")),
    };
    Ok(action)
}

fn keep(annotation: &Annotation) -> ResolutionAction {
    ResolutionAction::KeptAnnotation {
        winner_id: annotation.id,
    }
}

/// Union of label sets and position range, averaged confidence, joined notes
pub fn merge_annotations(annotations: &[Annotation]) -> Annotation {
    let mut merged = annotations[0].clone();
    merged.id = Uuid::new_v4();
    for other in &annotations[1..] {
        merged.labels.extend(other.labels.iter().cloned());
        merged.start_offset = merged.start_offset.min(other.start_offset);
        merged.end_offset = merged.end_offset.max(other.end_offset);
        merged.notes = match (merged.notes.take(), other.notes.clone()) {
            (Some(a), Some(b)) => Some(format!("{}\n{}", a, b)),
            (a, b) => a.or(b),
        };
    }
    let confidences: Vec<f64> = annotations.iter().filter_map(|a| a.confidence).collect();
    merged.confidence = if confidences.is_empty() {
        None
    } else {
        Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
    };
    merged.updated_at = Utc::now();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::annotation::AnnotationDraft;

    fn annotation(
        author: &str,
        start: usize,
        end: usize,
        labels: &[&str],
        confidence: Option<f64>,
    ) -> Annotation {
        let draft = AnnotationDraft {
            local_id: "L".to_string(),
            text_id: "T1".to_string(),
            start_offset: start,
            end_offset: end,
            text: "x".repeat(end - start),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            confidence,
            notes: None,
            extra: serde_json::Map::new(),
        };
        draft.into_annotation(author)
    }

    #[test]
    fn test_label_conflict_on_overlap() {
        // REQUIREMENT: Overlapping ranges carrying a conflicting label pair raise
        // a label-conflict with severity high
        // PURPOSE: Verify the third end-to-end scenario's detection step

        let resolver = ConflictResolver::new();
        let alice = annotation("alice", 100, 130, &["positive"], None);
        let bob = annotation("bob", 120, 150, &["negative"], None);

        let detected = resolver.detect(&bob, &[alice], "r1");
        let kinds: Vec<ConflictType> = detected.iter().map(|c| c.conflict_type).collect();
        assert!(kinds.contains(&ConflictType::PositionOverlap));
        assert!(kinds.contains(&ConflictType::LabelConflict));

        let label = detected
            .iter()
            .find(|c| c.conflict_type == ConflictType::LabelConflict)
            .unwrap();
        assert_eq!(label.severity, ConflictSeverity::High);
        assert_eq!(max_severity(&detected), Some(ConflictSeverity::High));
    }

    #[test]
    fn test_overlap_severity_fractions() {
        // REQUIREMENT: Overlap fraction > 0.8 is high, > 0.5 medium, else low
        // PURPOSE: Verify the severity grading of position overlaps

        let resolver = ConflictResolver::new();
        let base = annotation("alice", 0, 100, &["a"], None);

        let tiny = annotation("bob", 90, 190, &["b"], None);
        let detected = resolver.detect(&tiny, &[base.clone()], "r1");
        assert_eq!(detected[0].severity, ConflictSeverity::Low);

        let heavy = annotation("bob", 10, 105, &["b"], None);
        let detected = resolver.detect(&heavy, &[base.clone()], "r2");
        assert_eq!(detected[0].severity, ConflictSeverity::High);

        let half = annotation("bob", 40, 140, &["b"], None);
        let detected = resolver.detect(&half, &[base], "r3");
        assert_eq!(detected[0].severity, ConflictSeverity::Medium);
    }

    #[test]
    fn test_content_conflict_identical_range_different_labels() {
        let resolver = ConflictResolver::new();
        let alice = annotation("alice", 10, 20, &["L_a"], None);
        let bob = annotation("bob", 10, 20, &["L_b"], None);

        let detected = resolver.detect(&bob, &[alice], "r1");
        assert!(detected
            .iter()
            .any(|c| c.conflict_type == ConflictType::ContentConflict));
    }

    #[test]
    fn test_temporal_conflict_same_annotation() {
        // REQUIREMENT: Two edits by distinct authors on the same annotation
        // within five seconds raise a temporal conflict
        // PURPOSE: Verify the near-simultaneous-edit detection branch

        let resolver = ConflictResolver::new();
        let stored = annotation("alice", 10, 20, &["L_a"], None);
        let mut edited = stored.clone();
        edited.author_id = "bob".to_string();
        edited.updated_at = stored.updated_at + chrono::Duration::seconds(2);

        let detected = resolver.detect(&edited, &[stored.clone()], "r1");
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].conflict_type, ConflictType::TemporalConflict);

        // the same author editing twice is fine
        let mut again = stored.clone();
        again.updated_at = stored.updated_at + chrono::Duration::seconds(1);
        assert!(resolver.detect(&again, &[stored], "r2").is_empty());
    }

    #[test]
    fn test_no_conflict_across_texts_or_disjoint() {
        let resolver = ConflictResolver::new();
        let a = annotation("alice", 10, 20, &["positive"], None);
        let mut other_text = annotation("bob", 10, 20, &["negative"], None);
        other_text.text_id = "T2".to_string();
        assert!(resolver.detect(&other_text, &[a.clone()], "r1").is_empty());

        let disjoint = annotation("bob", 50, 60, &["negative"], None);
        assert!(resolver.detect(&disjoint, &[a], "r1").is_empty());
    }

    #[test]
    fn test_last_and_first_write_wins() {
        let resolver = ConflictResolver::new();
        let mut first = annotation("alice", 0, 10, &["a"], None);
        let mut last = annotation("bob", 5, 15, &["b"], None);
        first.created_at = first.created_at - chrono::Duration::seconds(60);
        last.updated_at = last.updated_at + chrono::Duration::seconds(60);

        let detected = resolver.detect(&last, &[first.clone()], "r1");
        let conflict_id = detected[0].id;

        let resolved = resolver
            .resolve(
                conflict_id,
                "r1",
                ResolutionStrategy::LastWriteWins,
                &ResolutionContext::default(),
            )
            .unwrap();
        match &resolved.resolution.as_ref().unwrap().action {
            ResolutionAction::KeptAnnotation { winner_id } => assert_eq!(*winner_id, last.id),
            _ => panic!("expected kept annotation"),
        }

        // re-detect in a fresh room for the first-write strategy
        let detected = resolver.detect(&last, &[first.clone()], "r2");
        let resolved = resolver
            .resolve(
                detected[0].id,
                "r2",
                ResolutionStrategy::FirstWriteWins,
                &ResolutionContext::default(),
            )
            .unwrap();
        match &resolved.resolution.as_ref().unwrap().action {
            ResolutionAction::KeptAnnotation { winner_id } => assert_eq!(*winner_id, first.id),
            _ => panic!("expected kept annotation"),
        }
    }

    #[test]
    fn test_merge_annotations_strategy_and_idempotence() {
        // REQUIREMENT: Merge unions label sets and ranges, averages confidence,
        // concatenates notes; mergeAnnotations(a, a) = a for labels and range
        // PURPOSE: Verify the merge algebra and its idempotence law

        let mut a = annotation("alice", 10, 30, &["positive"], Some(0.8));
        a.notes = Some("first pass".to_string());
        let b = annotation("bob", 20, 40, &["negative"], Some(0.4));

        let merged = merge_annotations(&[a.clone(), b.clone()]);
        assert_eq!(merged.start_offset, 10);
        assert_eq!(merged.end_offset, 40);
        assert!(merged.labels.contains("positive") && merged.labels.contains("negative"));
        assert!((merged.confidence.unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(merged.notes.as_deref(), Some("first pass"));

        let self_merge = merge_annotations(&[a.clone(), a.clone()]);
        assert_eq!(self_merge.labels, a.labels);
        assert_eq!(self_merge.start_offset, a.start_offset);
        assert_eq!(self_merge.end_offset, a.end_offset);
    }

    #[test]
    fn test_priority_confidence_voting_and_manual() {
        let resolver = ConflictResolver::new();
        let a = annotation("alice", 0, 10, &["a"], Some(0.9));
        let b = annotation("bob", 5, 15, &["b"], Some(0.3));
        let detected = resolver.detect(&b, &[a.clone()], "r1");
        let conflict_id = detected[0].id;

        // user priority
        let mut context = ResolutionContext::default();
        context.priorities.insert("bob".to_string(), 10);
        context.priorities.insert("alice".to_string(), 1);
        let resolved = resolver
            .resolve(conflict_id, "r1", ResolutionStrategy::UserPriority, &context)
            .unwrap();
        match &resolved.resolution.as_ref().unwrap().action {
            ResolutionAction::KeptAnnotation { winner_id } => assert_eq!(*winner_id, b.id),
            _ => panic!("expected kept annotation"),
        }

        // confidence
        let detected = resolver.detect(&b, &[a.clone()], "r2");
        let resolved = resolver
            .resolve(
                detected[0].id,
                "r2",
                ResolutionStrategy::ConfidenceBased,
                &ResolutionContext::default(),
            )
            .unwrap();
        match &resolved.resolution.as_ref().unwrap().action {
            ResolutionAction::KeptAnnotation { winner_id } => assert_eq!(*winner_id, a.id),
            _ => panic!("expected kept annotation"),
        }

        // voting
        let detected = resolver.detect(&b, &[a.clone()], "r3");
        let mut context = ResolutionContext::default();
        context.votes.insert(b.id, 5);
        context.votes.insert(a.id, 2);
        let resolved = resolver
            .resolve(detected[0].id, "r3", ResolutionStrategy::VotingBased, &context)
            .unwrap();
        match &resolved.resolution.as_ref().unwrap().action {
            ResolutionAction::KeptAnnotation { winner_id } => assert_eq!(*winner_id, b.id),
            _ => panic!("expected kept annotation"),
        }

        // manual defers
        let detected = resolver.detect(&b, &[a], "r4");
        let resolved = resolver
            .resolve(
                detected[0].id,
                "r4",
                ResolutionStrategy::ManualResolution,
                &ResolutionContext::default(),
            )
            .unwrap();
        assert!(matches!(
            resolved.resolution.as_ref().unwrap().action,
            ResolutionAction::RequiresInput
        ));
        assert_eq!(resolved.status, ConflictStatus::Resolved);
    }

    #[test]
    fn test_metrics_rollup() {
        // REQUIREMENT: Per room: totals by type and severity, pending vs resolved
        // PURPOSE: Verify the conflict metrics surface

        let resolver = ConflictResolver::new();
        let a = annotation("alice", 100, 130, &["positive"], None);
        let b = annotation("bob", 120, 150, &["negative"], None);
        let detected = resolver.detect(&b, &[a], "r1");
        assert_eq!(detected.len(), 2);

        resolver
            .resolve(
                detected[0].id,
                "r1",
                ResolutionStrategy::LastWriteWins,
                &ResolutionContext::default(),
            )
            .unwrap();

        let metrics = resolver.metrics("r1");
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.resolved, 1);
        assert_eq!(metrics.by_type.get("label-conflict"), Some(&1));
        assert_eq!(metrics.by_type.get("position-overlap"), Some(&1));
    }
}

//! Visit deduplication.
//!
//! Collapses a continuous presence in front of the camera into one event per
//! visit. All mutable state lives in [`RecognitionState`], which the caller
//! owns and passes in; the tracker itself only holds policy.

use crate::matcher::MatchResult;
use crate::types::{Embedding, PersonId};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Deduplication policy.
#[derive(Debug, Clone, Copy)]
pub struct TrackerPolicy {
    /// Minimum time between two visits of the same person.
    pub visit_cooldown: Duration,
    /// Minimum time between two unknown sightings of the same face.
    /// Also the retention horizon of the recent-unknown window.
    pub unknown_cooldown: Duration,
    /// Distance under which two unknown embeddings are the same face.
    pub tolerance: f32,
    /// Maximum number of recent unknown faces remembered.
    pub unknown_window_size: usize,
}

/// A recently emitted unknown face.
#[derive(Debug, Clone, PartialEq)]
struct RecentUnknown {
    embedding: Embedding,
    last_emitted_at: DateTime<Utc>,
}

/// Process-local recognition state owned by a single pipeline.
#[derive(Debug, Default, Clone)]
pub struct RecognitionState {
    last_visit: HashMap<PersonId, DateTime<Utc>>,
    recent_unknowns: VecDeque<RecentUnknown>,
}

impl RecognitionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time of the last visit emitted for `person`.
    pub fn last_visit(&self, person: PersonId) -> Option<DateTime<Utc>> {
        self.last_visit.get(&person).copied()
    }

    /// Number of unknown faces currently remembered.
    pub fn recent_unknown_count(&self) -> usize {
        self.recent_unknowns.len()
    }

    /// Forget a person, e.g. after it was removed from the registry.
    pub fn forget_person(&mut self, person: PersonId) {
        self.last_visit.remove(&person);
    }
}

/// Decision for one observed face.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerDecision {
    /// A new visit of a known person begins.
    Visit {
        person_id: PersonId,
        person_name: String,
        confidence: f32,
        at: DateTime<Utc>,
    },
    /// A new unknown face was seen.
    Unknown { at: DateTime<Utc> },
    /// Repeat sighting inside a cooldown window.
    Suppressed,
}

impl TrackerDecision {
    pub fn is_emitted(&self) -> bool {
        !matches!(self, Self::Suppressed)
    }
}

pub struct VisitTracker {
    policy: TrackerPolicy,
}

impl VisitTracker {
    pub fn new(policy: TrackerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TrackerPolicy {
        &self.policy
    }

    /// Feed one matched or unmatched face observed at `at`.
    pub fn observe(
        &self,
        state: &mut RecognitionState,
        at: DateTime<Utc>,
        matched: &MatchResult,
        embedding: &Embedding,
    ) -> TrackerDecision {
        match &matched.person {
            Some(person) => {
                if let Some(last) = state.last_visit.get(&person.id) {
                    if at - *last < self.policy.visit_cooldown {
                        tracing::trace!(person = person.id, "suppressing repeat sighting");
                        return TrackerDecision::Suppressed;
                    }
                }
                state.last_visit.insert(person.id, at);
                TrackerDecision::Visit {
                    person_id: person.id,
                    person_name: person.name.clone(),
                    confidence: matched.confidence,
                    at,
                }
            }
            None => self.observe_unknown(state, at, embedding),
        }
    }

    /// Entries older than the unknown cooldown are evicted before lookup; the
    /// window is capped at `unknown_window_size`, oldest first.
    fn observe_unknown(
        &self,
        state: &mut RecognitionState,
        at: DateTime<Utc>,
        embedding: &Embedding,
    ) -> TrackerDecision {
        let horizon = self.policy.unknown_cooldown;
        state
            .recent_unknowns
            .retain(|entry| at - entry.last_emitted_at < horizon);

        // Every retained entry is inside its cooldown, so any face within
        // tolerance of one of them is a repeat.
        let repeat = state
            .recent_unknowns
            .iter()
            .map(|entry| entry.embedding.distance(embedding))
            .min_by(f32::total_cmp)
            .is_some_and(|d| d <= self.policy.tolerance);

        if repeat {
            tracing::trace!("suppressing repeat unknown sighting");
            return TrackerDecision::Suppressed;
        }

        while state.recent_unknowns.len() >= self.policy.unknown_window_size.max(1) {
            state.recent_unknowns.pop_front();
        }
        state.recent_unknowns.push_back(RecentUnknown {
            embedding: embedding.clone(),
            last_emitted_at: at,
        });

        TrackerDecision::Unknown { at }
    }
}

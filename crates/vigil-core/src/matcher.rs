//! Face matching against the known-persons registry.

use crate::types::{Embedding, Person, PersonId};

/// Distances closer than this are treated as equal for tie-breaking.
const TIE_EPSILON: f32 = 1e-6;

/// Result of matching a probe embedding against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// The matched person, if the best candidate was within tolerance.
    pub person: Option<MatchedPerson>,
    /// Normalised distance to the nearest stored embedding (1.0 for an empty registry).
    pub distance: f32,
    /// `1 - distance`, clamped to [0, 1].
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPerson {
    pub id: PersonId,
    pub name: String,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.person.is_some()
    }

    fn unknown(distance: f32) -> Self {
        Self {
            person: None,
            distance,
            confidence: confidence_from_distance(distance),
        }
    }
}

/// Monotonic transform of distance to confidence.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Strategy for comparing a probe embedding against the enrolled registry.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, registry: &[Person]) -> MatchResult;
}

/// Nearest-neighbour matcher over every embedding of every person.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    /// Maximum normalised distance accepted as a match, in [0, 1].
    pub tolerance: f32,
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, probe: &Embedding, registry: &[Person]) -> MatchResult {
        let mut best: Option<(f32, &Person)> = None;

        for person in registry {
            for stored in &person.embeddings {
                let d = probe.distance(stored);
                best = match best {
                    None => Some((d, person)),
                    Some((best_d, best_p)) => {
                        let tied = (d - best_d).abs() <= TIE_EPSILON;
                        if (tied && person.id < best_p.id) || (!tied && d < best_d) {
                            Some((d, person))
                        } else {
                            Some((best_d, best_p))
                        }
                    }
                };
            }
        }

        match best {
            Some((distance, person)) if distance <= self.tolerance => MatchResult {
                person: Some(MatchedPerson {
                    id: person.id,
                    name: person.name.clone(),
                }),
                distance,
                confidence: confidence_from_distance(distance),
            },
            Some((distance, _)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: PersonId, name: &str, embeddings: Vec<Vec<f32>>) -> Person {
        Person {
            id,
            name: name.into(),
            embeddings: embeddings.into_iter().map(Embedding::new).collect(),
            notes: String::new(),
            first_seen: None,
            last_seen: None,
            visit_count: 0,
        }
    }

    #[test]
    fn test_match_within_tolerance() {
        let registry = vec![
            person(1, "alice", vec![vec![1.0, 0.0]]),
            person(2, "bob", vec![vec![0.0, 1.0]]),
        ];
        let probe = Embedding::new(vec![0.0, 0.9]);
        let result = EuclideanMatcher::new(0.6).best_match(&probe, &registry);
        assert_eq!(result.person.map(|p| p.name), Some("bob".to_string()));
        assert!((result.distance - 0.05).abs() < 1e-6);
        assert!((result.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_best_of_multiple_embeddings_per_person() {
        let registry = vec![
            person(1, "alice", vec![vec![0.0, 1.0], vec![1.0, 0.0]]),
            person(2, "bob", vec![vec![0.8, 0.2]]),
        ];
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher::new(0.6).best_match(&probe, &registry);
        assert_eq!(result.person.map(|p| p.id), Some(1));
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_outside_tolerance_is_unknown() {
        let registry = vec![person(1, "alice", vec![vec![1.0, 0.0]])];
        let probe = Embedding::new(vec![-1.0, 0.0]);
        let result = EuclideanMatcher::new(0.6).best_match(&probe, &registry);
        assert!(!result.is_match());
        assert!((result.distance - 1.0).abs() < 1e-6);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_empty_registry_is_unknown() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher::new(1.0).best_match(&probe, &[]);
        assert!(!result.is_match());
        assert_eq!(result.distance, 1.0);
    }

    #[test]
    fn test_confidence_increases_as_distance_decreases() {
        let registry = vec![person(1, "alice", vec![vec![1.0, 0.0]])];
        let matcher = EuclideanMatcher::new(0.6);
        let mut last_confidence = -1.0f32;
        for step in (0..=10).rev() {
            let offset = step as f32 * 0.1;
            let probe = Embedding::new(vec![1.0, offset]);
            let result = matcher.best_match(&probe, &registry);
            assert_eq!(result.person.as_ref().map(|p| p.id), Some(1));
            assert!(result.confidence > last_confidence);
            last_confidence = result.confidence;
        }
        assert_eq!(last_confidence, 1.0);
    }

    #[test]
    fn test_zero_tolerance_requires_identical_embedding() {
        let registry = vec![person(1, "alice", vec![vec![0.6, 0.8]])];
        let matcher = EuclideanMatcher::new(0.0);
        assert!(matcher
            .best_match(&Embedding::new(vec![0.6, 0.8]), &registry)
            .is_match());
        assert!(!matcher
            .best_match(&Embedding::new(vec![0.6, 0.800001]), &registry)
            .is_match());
    }

    #[test]
    fn test_full_tolerance_always_matches() {
        let registry = vec![person(7, "alice", vec![vec![1.0, 0.0]])];
        let matcher = EuclideanMatcher::new(1.0);
        for probe in [vec![-1.0, 0.0], vec![0.0, -1.0], vec![50.0, 50.0], vec![1.0]] {
            let result = matcher.best_match(&Embedding::new(probe), &registry);
            assert_eq!(result.person.map(|p| p.id), Some(7));
        }
    }

    #[test]
    fn test_tie_breaks_to_smaller_id() {
        let registry = vec![
            person(9, "zed", vec![vec![0.0, 1.0]]),
            person(3, "amy", vec![vec![0.0, -1.0]]),
        ];
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher::new(1.0).best_match(&probe, &registry);
        assert_eq!(result.person.map(|p| p.id), Some(3));

        let reversed: Vec<Person> = registry.into_iter().rev().collect();
        let result = EuclideanMatcher::new(1.0).best_match(&probe, &reversed);
        assert_eq!(result.person.map(|p| p.id), Some(3));
    }
}

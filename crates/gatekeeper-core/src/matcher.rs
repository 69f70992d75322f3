//! Nearest-match decision for a single probe.

use crate::enrollment::EmbeddingStore;
use crate::types::{Embedding, MatchResult};
use thiserror::Error;

/// Default Euclidean tolerance for a candidate reference.
pub const DEFAULT_TOLERANCE: f32 = 0.7;

#[derive(Error, Debug, PartialEq)]
pub enum MatchingError {
    #[error("probe has {actual} dimensions, enrolled embeddings have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("probe embedding contains non-finite values")]
    NonFinite,
}

/// Strategy for deciding which enrolled identity (if any) a probe belongs to.
pub trait Matcher: Send + Sync {
    fn match_probe(
        &self,
        probe: &Embedding,
        store: &EmbeddingStore,
    ) -> Result<MatchResult, MatchingError>;
}

/// Majority vote over every reference embedding within `tolerance`.
///
/// Each reference within tolerance of the probe is a candidate; the
/// identity owning the most candidates wins. Ties go to the identity
/// enrolled first. The reported distance is the winner's closest candidate.
#[derive(Debug, Clone, Copy)]
pub struct MajorityVoteMatcher {
    pub tolerance: f32,
}

impl MajorityVoteMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Default for MajorityVoteMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

/// Per-identity candidate tally, kept in enrollment order.
struct Tally<'a> {
    name: &'a str,
    votes: usize,
    best_distance: f32,
}

impl Matcher for MajorityVoteMatcher {
    fn match_probe(
        &self,
        probe: &Embedding,
        store: &EmbeddingStore,
    ) -> Result<MatchResult, MatchingError> {
        if probe.dim() != store.dimension() {
            return Err(MatchingError::DimensionMismatch {
                expected: store.dimension(),
                actual: probe.dim(),
            });
        }
        if !probe.is_finite() {
            return Err(MatchingError::NonFinite);
        }

        let mut tallies: Vec<Tally<'_>> = Vec::new();
        for (identity, reference) in store.all_embeddings() {
            let distance = probe.euclidean_distance(reference);
            // NaN never counts as within tolerance.
            if !(distance <= self.tolerance) {
                continue;
            }
            // Names are unique in the store, so the last tally is the only
            // one that can belong to this identity.
            match tallies.last_mut() {
                Some(t) if t.name == identity.name => {
                    t.votes += 1;
                    t.best_distance = t.best_distance.min(distance);
                }
                _ => tallies.push(Tally {
                    name: &identity.name,
                    votes: 1,
                    best_distance: distance,
                }),
            }
        }

        // Strictly-greater keeps the earliest identity on ties.
        let mut winner: Option<&Tally<'_>> = None;
        for tally in &tallies {
            if winner.map_or(true, |w| tally.votes > w.votes) {
                winner = Some(tally);
            }
        }

        Ok(match winner {
            Some(w) => MatchResult::Matched {
                identity: w.name.to_string(),
                distance: w.best_distance,
            },
            None => MatchResult::Unmatched,
        })
    }
}

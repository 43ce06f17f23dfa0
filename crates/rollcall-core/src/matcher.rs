//! Nearest-neighbor matching of a probe embedding against a registry
//! snapshot. Pure and deterministic — correctness must not depend on
//! call order or any global state.

use crate::types::{Embedding, RegistrySnapshot};

/// Outcome of matching one probe against the registry.
///
/// An empty registry is reported as its own case: it indicates a
/// misconfigured system, not a bad probe, and must never be conflated
/// with a low-confidence result.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        identity: i64,
        display_name: String,
        /// `max(0, 1 − distance)`, strictly above the threshold.
        confidence: f32,
    },
    BelowThreshold {
        /// Confidence of the best candidate, for logging.
        confidence: f32,
    },
    EmptyRegistry,
}

/// Strategy for comparing a probe embedding against the registry.
pub trait Matcher {
    fn match_probe(
        &self,
        probe: &Embedding,
        registry: &RegistrySnapshot,
        threshold: f32,
    ) -> MatchOutcome;
}

/// Euclidean-distance matcher: the entry with minimum distance wins,
/// confidence is `1 − distance` floored at zero.
///
/// Exact distance ties resolve to the first entry in registry iteration
/// order, so results are reproducible across runs for identical input.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn match_probe(
        &self,
        probe: &Embedding,
        registry: &RegistrySnapshot,
        threshold: f32,
    ) -> MatchOutcome {
        if registry.is_empty() {
            return MatchOutcome::EmptyRegistry;
        }

        let mut best_idx = 0usize;
        let mut best_dist = f32::INFINITY;
        for (i, entry) in registry.entries().iter().enumerate() {
            let dist = probe.distance(&entry.embedding);
            // Strict < keeps the first entry on an exact tie.
            if dist < best_dist {
                best_dist = dist;
                best_idx = i;
            }
        }

        let confidence = (1.0 - best_dist).max(0.0);
        if confidence > threshold {
            let entry = &registry.entries()[best_idx];
            MatchOutcome::Matched {
                identity: entry.identity,
                display_name: entry.display_name.clone(),
                confidence,
            }
        } else {
            MatchOutcome::BelowThreshold { confidence }
        }
    }
}

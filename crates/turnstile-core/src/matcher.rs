//! Gallery search.

use crate::types::{Embedding, GalleryEntry};

/// Default maximum Euclidean distance for a positive identity match.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Result of searching a gallery for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome<'g> {
    Identified {
        entry: &'g GalleryEntry,
        distance: f32,
    },
    Unknown,
}

impl<'g> MatchOutcome<'g> {
    pub fn identity(&self) -> Option<&'g str> {
        match self {
            Self::Identified { entry, .. } => Some(entry.identity.as_str()),
            Self::Unknown => None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn find<'g>(
        &self,
        probe: &Embedding,
        gallery: &'g [GalleryEntry],
        tolerance: f32,
    ) -> MatchOutcome<'g>;
}

/// Linear scan in gallery order returning the FIRST entry strictly within
/// tolerance.
///
/// This is first-match, not best-match: with near-duplicate enrollments,
/// gallery order decides which identity wins.
pub struct FirstMatch;

impl Matcher for FirstMatch {
    fn find<'g>(
        &self,
        probe: &Embedding,
        gallery: &'g [GalleryEntry],
        tolerance: f32,
    ) -> MatchOutcome<'g> {
        for entry in gallery {
            if entry.embedding.dim() != probe.dim() {
                tracing::warn!(
                    identity = %entry.identity,
                    stored = entry.embedding.dim(),
                    probe = probe.dim(),
                    "skipping gallery entry with mismatched embedding size"
                );
                continue;
            }
            let distance = probe.euclidean_distance(&entry.embedding);
            if distance < tolerance {
                return MatchOutcome::Identified { entry, distance };
            }
        }
        MatchOutcome::Unknown
    }
}

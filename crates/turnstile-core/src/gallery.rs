//! Persistence seams: the enrolled gallery and the access event log.

use crate::types::{AccessAction, Embedding, GalleryEntry};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("identity already enrolled: {0}")]
    Duplicate(String),
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Enrolled identities, enumerated in a stable (insertion) order.
pub trait GalleryStore: Send + Sync {
    fn enumerate(&self) -> Result<Vec<GalleryEntry>, GalleryError>;

    /// Enroll an identity. Returns the new entry id.
    fn append(
        &self,
        identity: &str,
        embedding: &Embedding,
        image: Option<&[u8]>,
    ) -> Result<i64, GalleryError>;
}

/// Entry/exit event sink.
pub trait EventLog: Send + Sync {
    fn record(&self, entry: &GalleryEntry, action: AccessAction) -> Result<(), GalleryError>;
}

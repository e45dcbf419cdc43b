use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::frame::Frame;

/// The enrolled identity photo that turn frames are matched against.
///
/// Owned by the enrolment flow; the verification gate only reads it.
#[derive(Debug, Clone)]
pub struct IdentityReference {
    /// Hex SHA-256 of the encoded image. Doubles as the reference handle.
    pub digest: String,
    pub frame: Frame,
    pub enrolled_at: DateTime<Utc>,
}

impl IdentityReference {
    pub fn new(frame: Frame) -> Self {
        Self::with_enrolled_at(frame, Utc::now())
    }

    /// Rebuild a reference that was enrolled earlier (e.g. loaded from disk).
    pub fn with_enrolled_at(frame: Frame, enrolled_at: DateTime<Utc>) -> Self {
        let digest = format!("{:x}", Sha256::digest(frame.bytes()));
        Self {
            digest,
            frame,
            enrolled_at,
        }
    }
}

/// Holds the single active identity reference.
///
/// Readers take an `Arc` snapshot, so replacing the reference never affects
/// a verification already in flight.
#[derive(Debug, Default)]
pub struct IdentitySlot {
    current: RwLock<Option<Arc<IdentityReference>>>,
}

impl IdentitySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<Arc<IdentityReference>> {
        self.current.read().await.clone()
    }

    /// Install a new reference, returning the one it replaced.
    pub async fn replace(&self, reference: IdentityReference) -> Option<Arc<IdentityReference>> {
        tracing::info!(digest = %reference.digest, "identity reference installed");
        self.current.write().await.replace(Arc::new(reference))
    }

    pub async fn clear(&self) -> Option<Arc<IdentityReference>> {
        let previous = self.current.write().await.take();
        if previous.is_some() {
            tracing::info!("identity reference cleared");
        }
        previous
    }

    pub async fn is_enrolled(&self) -> bool {
        self.current.read().await.is_some()
    }
}

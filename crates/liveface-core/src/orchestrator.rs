use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::frame::{Frame, FrameError};
use crate::gate::VerificationGate;
use crate::identity::IdentitySlot;
use crate::machine::{self, ChallengePolicy, FrameOutcome};
use crate::perception::{DetectorError, FaceDetector, FaceVerifier, PerceptionAdapter};
use crate::session::SessionStatus;
use crate::store::SessionStore;
use crate::types::{Challenge, FrameClassification};

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] FrameError),
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("no face detected in identity photo")]
    NoFaceInIdentityPhoto,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("frame processing aborted: {0}")]
    Aborted(String),
}

/// Everything a caller needs to render feedback for one submitted frame.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeResult {
    pub challenge: Challenge,
    pub outcome: FrameOutcome,
    pub message: String,
    pub classification: FrameClassification,
    pub status: SessionStatus,
}

/// Service-level health summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub active_sessions: usize,
    pub identity_enrolled: bool,
}

/// Public entry point: classify a frame, apply it to its session, commit.
pub struct Orchestrator<D, V> {
    perception: Arc<PerceptionAdapter<D>>,
    gate: Arc<VerificationGate<V>>,
    store: Arc<SessionStore>,
    identity: Arc<IdentitySlot>,
    policy: Arc<ChallengePolicy>,
    clock: Arc<dyn Clock>,
}

impl<D: FaceDetector, V: FaceVerifier> Orchestrator<D, V> {
    pub fn new(detector: D, verifier: V, store: Arc<SessionStore>, policy: ChallengePolicy) -> Self {
        Self {
            perception: Arc::new(PerceptionAdapter::new(detector)),
            gate: Arc::new(VerificationGate::new(verifier)),
            store,
            identity: Arc::new(IdentitySlot::new()),
            policy: Arc::new(policy),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_identity(mut self, identity: Arc<IdentitySlot>) -> Self {
        self.identity = identity;
        self
    }

    pub fn identity(&self) -> &IdentitySlot {
        &self.identity
    }

    pub fn policy(&self) -> &ChallengePolicy {
        &self.policy
    }

    /// Process one frame submitted for `challenge`.
    ///
    /// Fails only when the image bytes are unusable (the session is not
    /// touched). Detector and verifier failures come back as outcomes.
    pub async fn process_frame(
        &self,
        session_id: &str,
        raw: &[u8],
        challenge: Challenge,
    ) -> Result<ChallengeResult, LivenessError> {
        if session_id.trim().is_empty() {
            return Err(LivenessError::EmptySessionId);
        }
        let frame = decode_frame(raw).await.map_err(|e| {
            tracing::warn!(session = session_id, error = %e, "rejecting unreadable frame");
            e
        })?;

        loop {
            let handle = self.store.get_or_create(session_id, self.clock.now()).await;
            let Some(mut guard) = handle.lock().await else {
                tracing::debug!(session = session_id, "session reset while waiting; re-resolving");
                continue;
            };

            let current = guard.session().clone();
            let identity = self.identity.current().await;
            let now = self.clock.now();
            let frame = frame.clone();
            let perception = Arc::clone(&self.perception);
            let gate = Arc::clone(&self.gate);
            let policy = Arc::clone(&self.policy);

            // Work on a copy; nothing is stored unless the step returns.
            let (classification, next, outcome) = tokio::task::spawn_blocking(move || {
                let classification = perception.classify(&frame);
                let (next, outcome) =
                    machine::apply(current, challenge, &classification, now, &policy, || {
                        gate.check(&frame, identity.as_deref())
                    });
                (classification, next, outcome)
            })
            .await
            .map_err(|e| {
                tracing::error!(session = session_id, error = %e, "frame worker failed");
                LivenessError::Aborted(e.to_string())
            })?;

            guard.commit(next);
            let status = guard.session().status();
            drop(guard);

            log_outcome(session_id, challenge, &outcome, &status);

            return Ok(ChallengeResult {
                challenge,
                message: guidance(challenge, &outcome),
                outcome,
                classification,
                status,
            });
        }
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.store.get(session_id).await.map(|s| s.status())
    }

    /// Discard a session. Returns whether it existed.
    pub async fn reset(&self, session_id: &str) -> bool {
        self.store.delete(session_id).await
    }

    pub async fn reset_all(&self) -> usize {
        self.store.clear_all().await
    }

    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        self.store.evict_idle(max_idle, self.clock.now()).await
    }

    pub async fn health(&self) -> Health {
        Health {
            active_sessions: self.store.count().await,
            identity_enrolled: self.identity.is_enrolled().await,
        }
    }

    /// Validate a candidate identity photo: it must decode and contain a face.
    pub async fn check_identity_photo(&self, raw: &[u8]) -> Result<Frame, LivenessError> {
        let frame = decode_frame(raw).await?;
        let perception = Arc::clone(&self.perception);
        let candidate = frame.clone();
        let has_face = tokio::task::spawn_blocking(move || perception.has_face(&candidate))
            .await
            .map_err(|e| LivenessError::Aborted(e.to_string()))??;
        if !has_face {
            return Err(LivenessError::NoFaceInIdentityPhoto);
        }
        Ok(frame)
    }
}

/// Decode on the blocking pool; large images must not stall other sessions.
async fn decode_frame(raw: &[u8]) -> Result<Frame, LivenessError> {
    let bytes = raw.to_vec();
    tokio::task::spawn_blocking(move || Frame::decode(&bytes))
        .await
        .map_err(|e| LivenessError::Aborted(e.to_string()))?
        .map_err(LivenessError::from)
}

fn log_outcome(session: &str, challenge: Challenge, outcome: &FrameOutcome, status: &SessionStatus) {
    match outcome {
        FrameOutcome::Completed { score } => tracing::info!(
            session,
            challenge = %challenge,
            frame = status.frame_count,
            distance = score.map(|s| s.distance),
            liveness_complete = status.liveness_complete,
            "challenge completed"
        ),
        FrameOutcome::IdentityMismatch { distance, threshold } => tracing::warn!(
            session,
            challenge = %challenge,
            frame = status.frame_count,
            distance,
            threshold,
            "frame does not match enrolled identity"
        ),
        FrameOutcome::VerifierUnavailable { message } => tracing::warn!(
            session,
            challenge = %challenge,
            error = %message,
            "verifier unavailable"
        ),
        other => tracing::debug!(
            session,
            challenge = %challenge,
            frame = status.frame_count,
            outcome = ?other,
            "frame processed"
        ),
    }
}

fn guidance(challenge: Challenge, outcome: &FrameOutcome) -> String {
    match outcome {
        FrameOutcome::Completed { .. } => format!("{challenge} verified"),
        FrameOutcome::AlreadyCompleted => format!("{challenge} already verified"),
        FrameOutcome::Pending => match challenge {
            Challenge::Blink => "Please blink naturally.".to_string(),
            Challenge::Turn(dir) => format!("Please show the {} side of your face.", dir.as_str()),
        },
        FrameOutcome::NoFaceDetected => "No face detected. Please look at the camera.".to_string(),
        FrameOutcome::Rejected { reason } => reason.message().to_string(),
        FrameOutcome::IdentityMismatch { .. } => {
            "Face does not match the enrolled identity.".to_string()
        }
        FrameOutcome::VerifierUnavailable { .. } => {
            "Verification is temporarily unavailable. Please try again.".to_string()
        }
    }
}

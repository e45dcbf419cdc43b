use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use zbus::interface;

use liveface_core::{
    Challenge, Direction, FaceDetector, FaceVerifier, FrameOutcome, IdentityReference,
    LivenessError, Orchestrator,
};

use crate::config::Config;
use crate::identity_store::{IdentityStore, IdentityStoreError};
use crate::rate_limiter::{Attempt, Refused, SharedLimiter};
use crate::remote::RemotePerception;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidArgs(String),
    #[error(transparent)]
    RateLimited(#[from] Refused),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    #[error("identity store: {0}")]
    Store(#[from] IdentityStoreError),
    #[error("encoding reply: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::InvalidArgs(msg) => zbus::fdo::Error::InvalidArgs(msg),
            ServiceError::Liveness(
                e @ (LivenessError::InvalidInput(_)
                | LivenessError::EmptySessionId
                | LivenessError::NoFaceInIdentityPhoto),
            ) => zbus::fdo::Error::InvalidArgs(e.to_string()),
            ServiceError::RateLimited(refused) => zbus::fdo::Error::LimitsExceeded(refused.to_string()),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}

/// Shared state accessible by D-Bus method handlers.
///
/// Each field synchronizes itself; handlers for different sessions never
/// wait on each other.
pub struct AppState<D, V> {
    pub config: Config,
    pub orchestrator: Orchestrator<D, V>,
    pub identity_store: IdentityStore,
    /// Keyed by the digest of the enrolled reference, not by session.
    pub rate_limiter: SharedLimiter,
    /// Held across the store write and the in-memory swap so both always
    /// name the same reference.
    enrolment: Mutex<()>,
}

impl<D: FaceDetector, V: FaceVerifier> AppState<D, V> {
    pub fn new(config: Config, orchestrator: Orchestrator<D, V>, identity_store: IdentityStore) -> Self {
        Self {
            config,
            orchestrator,
            identity_store,
            rate_limiter: SharedLimiter::new(),
            enrolment: Mutex::new(()),
        }
    }

    /// Validate, persist and activate a new identity photo.
    pub async fn upload_identity(&self, image: &[u8]) -> Result<String, ServiceError> {
        let frame = self.orchestrator.check_identity_photo(image).await.map_err(|e| {
            tracing::warn!(error = %e, "identity photo rejected");
            e
        })?;
        let reference = IdentityReference::new(frame);

        let _enrolment = self.enrolment.lock().await;
        let id = self.identity_store.save(&reference).await.map_err(|e| {
            tracing::error!(error = %e, "identity: store save failed");
            e
        })?;

        let reply = serde_json::json!({
            "id": id,
            "digest": reference.digest,
            "enrolled_at": reference.enrolled_at.to_rfc3339(),
        });
        let previous = self.orchestrator.identity().replace(reference).await;
        tracing::info!(
            replaced = previous.is_some(),
            "identity reference uploaded"
        );
        Ok(reply.to_string())
    }

    /// Forget the identity reference, on disk and in memory.
    pub async fn reset_identity(&self) -> Result<bool, ServiceError> {
        let _enrolment = self.enrolment.lock().await;
        let stored = self.identity_store.clear().await?;
        let active = self.orchestrator.identity().clear().await.is_some();
        Ok(stored || active)
    }

    /// Process one frame and return the challenge result as JSON.
    pub async fn submit_frame(
        &self,
        session_id: &str,
        image: &[u8],
        challenge: Challenge,
    ) -> Result<String, ServiceError> {
        let identity = self
            .orchestrator
            .identity()
            .current()
            .await
            .map(|r| r.digest.clone())
            .unwrap_or_default();
        let permit = self
            .rate_limiter
            .acquire(&identity, Instant::now())
            .map_err(|refused| {
                tracing::warn!(session = session_id, error = %refused, "frame refused");
                refused
            })?;

        // On error the permit drops and releases its slot uncounted
        let result = self
            .orchestrator
            .process_frame(session_id, image, challenge)
            .await?;

        let attempt = match result.outcome {
            FrameOutcome::IdentityMismatch { .. } => Attempt::Mismatch,
            FrameOutcome::Completed { score: Some(_) } => Attempt::Matched,
            _ => Attempt::Other,
        };
        permit.finish(attempt, Instant::now());

        Ok(serde_json::to_string(&result)?)
    }

    /// Session status as JSON; `null` for an unknown session.
    pub async fn session_status(&self, session_id: &str) -> Result<String, ServiceError> {
        let status = self.orchestrator.status(session_id).await;
        Ok(serde_json::to_string(&status)?)
    }

    /// Mismatch lockouts survive session resets.
    pub async fn reset_session(&self, session_id: &str) -> bool {
        self.orchestrator.reset(session_id).await
    }

    pub async fn reset_all(&self) -> usize {
        self.orchestrator.reset_all().await
    }

    pub async fn health(&self) -> Result<String, ServiceError> {
        let health = self.orchestrator.health().await;
        let identity = self.identity_store.info().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "health: identity lookup failed");
            None
        });
        let policy = self.orchestrator.policy();
        Ok(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "active_sessions": health.active_sessions,
            "identity_enrolled": health.identity_enrolled,
            "identity": identity,
            "perception_url": self.config.perception_url,
            "order": policy.order,
        })
        .to_string())
    }

    /// Evict idle sessions and lapsed limiter records.
    pub async fn sweep(&self) -> usize {
        let evicted = self.orchestrator.evict_idle(self.config.session_idle()).await;
        let pruned = self.rate_limiter.prune(Instant::now());
        if evicted > 0 || pruned > 0 {
            tracing::info!(evicted, pruned, "idle sweep");
        }
        evicted
    }
}

/// D-Bus interface for the liveface daemon.
///
/// Bus name: org.liveface.Liveface1
/// Object path: /org/liveface/Liveface1
pub struct LivefaceService {
    pub state: Arc<AppState<RemotePerception, RemotePerception>>,
}

#[interface(name = "org.liveface.Liveface1")]
impl LivefaceService {
    /// Upload the identity photo that turn frames are matched against.
    ///
    /// Returns `{id, digest, enrolled_at}` as JSON.
    async fn upload_identity(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "upload_identity requested");
        Ok(self.state.upload_identity(&image).await?)
    }

    /// Remove the identity photo. Returns whether one was enrolled.
    async fn reset_identity(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("reset_identity requested");
        Ok(self.state.reset_identity().await?)
    }

    /// Submit a frame for the blink challenge. Returns the result as JSON.
    async fn submit_blink_frame(&self, session_id: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(session = session_id, bytes = image.len(), "blink frame received");
        Ok(self
            .state
            .submit_frame(session_id, &image, Challenge::Blink)
            .await?)
    }

    /// Submit a frame for a head turn; `direction` is "left" or "right".
    async fn submit_turn_frame(
        &self,
        session_id: &str,
        direction: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        let direction: Direction = direction
            .parse()
            .map_err(|e: String| zbus::fdo::Error::InvalidArgs(e))?;
        tracing::debug!(
            session = session_id,
            direction = direction.as_str(),
            bytes = image.len(),
            "turn frame received"
        );
        Ok(self
            .state
            .submit_frame(session_id, &image, Challenge::Turn(direction))
            .await?)
    }

    /// Session status as JSON, or `null` if the session does not exist.
    async fn session_status(&self, session_id: &str) -> zbus::fdo::Result<String> {
        Ok(self.state.session_status(session_id).await?)
    }

    /// Discard a session. Returns whether it existed.
    async fn reset_session(&self, session_id: &str) -> bool {
        tracing::info!(session = session_id, "reset_session requested");
        self.state.reset_session(session_id).await
    }

    /// Discard every session. Returns how many were removed.
    async fn reset_all(&self) -> u32 {
        tracing::info!("reset_all requested");
        u32::try_from(self.state.reset_all().await).unwrap_or(u32::MAX)
    }

    /// Return daemon health information as JSON.
    async fn health(&self) -> zbus::fdo::Result<String> {
        Ok(self.state.health().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveface_core::{
        BoundingBox, DetectedFace, Detection, DetectorError, DetectorKind, Frame, ManualClock,
        MatchScore, SessionStore, VerifierError,
    };
    use std::io::Cursor;
    use std::path::Path;

    const FRONTAL: u32 = 40;
    const LEFT: u32 = 41;
    const EMPTY: u32 = 42;

    struct WidthDetector;

    impl FaceDetector for WidthDetector {
        fn detect(&self, frame: &Frame) -> Result<Detection, DetectorError> {
            let face = |kind, eyes| DetectedFace {
                kind,
                bbox: BoundingBox {
                    x: frame.width as f32 / 2.0 - 5.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                },
                eyes,
            };
            let faces = match frame.width {
                FRONTAL => vec![face(DetectorKind::Frontal, 2)],
                LEFT => vec![face(DetectorKind::LeftProfile, 0)],
                _ => vec![],
            };
            Ok(Detection { faces })
        }
    }

    struct NeverMatches;

    impl FaceVerifier for NeverMatches {
        fn compare(&self, _: &IdentityReference, _: &Frame) -> Result<MatchScore, VerifierError> {
            Ok(MatchScore {
                matched: false,
                distance: 0.9,
                threshold: 0.68,
            })
        }
    }

    fn png(width: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, 10, image::Rgb([120, 100, 90]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    async fn state() -> (AppState<WidthDetector, NeverMatches>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = Config::from_lookup(|_| None);
        let orchestrator = Orchestrator::new(
            WidthDetector,
            NeverMatches,
            Arc::new(SessionStore::new()),
            config.policy(),
        )
        .with_clock(clock.clone());
        let store = IdentityStore::open(Path::new(":memory:")).await.unwrap();
        (AppState::new(config, orchestrator, store), clock)
    }

    fn json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn turn_without_identity_is_rejected() {
        let (state, _) = state().await;
        let reply = json(
            &state
                .submit_frame("s1", &png(LEFT), Challenge::Turn(Direction::Left))
                .await
                .unwrap(),
        );
        assert_eq!(reply["outcome"]["outcome"], "rejected");
        assert_eq!(reply["outcome"]["reason"], "no_identity_reference");
        assert_eq!(reply["status"]["frame_count"], 1);
    }

    #[tokio::test]
    async fn identity_upload_and_reset() {
        let (state, _) = state().await;

        let err = state.upload_identity(&png(EMPTY)).await.unwrap_err();
        assert!(matches!(
            zbus::fdo::Error::from(err),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(!state.orchestrator.identity().is_enrolled().await);

        let reply = json(&state.upload_identity(&png(FRONTAL)).await.unwrap());
        assert_eq!(reply["digest"].as_str().unwrap().len(), 64);
        let health = json(&state.health().await.unwrap());
        assert_eq!(health["identity_enrolled"], true);
        assert_eq!(health["identity"]["digest"], reply["digest"]);

        assert!(state.reset_identity().await.unwrap());
        assert!(!state.reset_identity().await.unwrap());
        let health = json(&state.health().await.unwrap());
        assert_eq!(health["identity_enrolled"], false);
    }

    #[tokio::test]
    async fn repeated_mismatches_lock_the_identity() {
        let (state, clock) = state().await;
        state.upload_identity(&png(FRONTAL)).await.unwrap();

        let left = Challenge::Turn(Direction::Left);
        for _ in 0..5 {
            let reply = json(&state.submit_frame("s1", &png(LEFT), left).await.unwrap());
            assert_eq!(reply["outcome"]["outcome"], "identity_mismatch");
            clock.advance_millis(400);
        }

        let err = state.submit_frame("s1", &png(LEFT), left).await.unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited(_)));
        assert!(matches!(
            zbus::fdo::Error::from(err),
            zbus::fdo::Error::LimitsExceeded(_)
        ));

        // Neither a fresh session id nor a reset gets around the lock
        let err = state.submit_frame("s2", &png(LEFT), left).await.unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited(Refused::Locked { .. })));
        assert!(state.reset_session("s1").await);
        assert!(matches!(
            state.submit_frame("s1", &png(LEFT), left).await,
            Err(ServiceError::RateLimited(_))
        ));
        state.reset_all().await;
        assert!(matches!(
            state.submit_frame("s3", &png(FRONTAL), Challenge::Blink).await,
            Err(ServiceError::RateLimited(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mismatches_never_exceed_the_limit() {
        let (state, _) = state().await;
        state.upload_identity(&png(FRONTAL)).await.unwrap();
        let state = Arc::new(state);

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    state
                        .submit_frame(&format!("s{i}"), &png(LEFT), Challenge::Turn(Direction::Left))
                        .await
                })
            })
            .collect();

        let mut mismatches = 0;
        let mut refused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(reply) => {
                    assert_eq!(json(&reply)["outcome"]["outcome"], "identity_mismatch");
                    mismatches += 1;
                }
                Err(ServiceError::RateLimited(_)) => refused += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(mismatches <= 5, "{mismatches} mismatches were scored");
        assert_eq!(mismatches + refused, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_leave_store_and_memory_in_agreement() {
        let (state, _) = state().await;
        let state = Arc::new(state);

        for _ in 0..50 {
            let a = tokio::spawn({
                let state = Arc::clone(&state);
                async move { state.upload_identity(&png(FRONTAL)).await }
            });
            let b = tokio::spawn({
                let state = Arc::clone(&state);
                async move { state.upload_identity(&png(LEFT)).await }
            });
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();

            let active = state.orchestrator.identity().current().await.unwrap();
            let stored = state.identity_store.load().await.unwrap().unwrap();
            assert_eq!(active.digest, stored.digest);
        }

        let reset = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.reset_identity().await }
        });
        let upload = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.upload_identity(&png(FRONTAL)).await }
        });
        reset.await.unwrap().unwrap();
        upload.await.unwrap().unwrap();
        let active = state.orchestrator.identity().current().await;
        let stored = state.identity_store.load().await.unwrap();
        assert_eq!(
            active.map(|r| r.digest.clone()),
            stored.map(|r| r.digest)
        );
    }

    #[tokio::test]
    async fn unknown_session_status_is_null() {
        let (state, _) = state().await;
        assert_eq!(state.session_status("ghost").await.unwrap(), "null");

        state
            .submit_frame("s1", &png(FRONTAL), Challenge::Blink)
            .await
            .unwrap();
        let status = json(&state.session_status("s1").await.unwrap());
        assert_eq!(status["session_id"], "s1");
        assert_eq!(status["liveness_complete"], false);
    }

    #[tokio::test]
    async fn unreadable_frame_maps_to_invalid_args() {
        let (state, _) = state().await;
        let err = state
            .submit_frame("s1", b"not an image", Challenge::Blink)
            .await
            .unwrap_err();
        assert!(matches!(
            zbus::fdo::Error::from(err),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert_eq!(state.session_status("s1").await.unwrap(), "null");
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions() {
        let (state, clock) = state().await;
        state
            .submit_frame("s1", &png(FRONTAL), Challenge::Blink)
            .await
            .unwrap();
        assert_eq!(state.sweep().await, 0);

        clock.advance(state.config.session_idle());
        assert_eq!(state.sweep().await, 1);
        assert_eq!(state.reset_all().await, 0);
    }
}

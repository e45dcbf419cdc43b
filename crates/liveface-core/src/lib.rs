//! liveface-core — Active liveness challenges bound to an enrolled identity.
//!
//! A caller submits camera frames for one of three challenges (blink, left
//! head-turn, right head-turn). Each frame is classified by an external face
//! detector, run through a per-session state machine with strict timing
//! windows, and, at the moment a turn is accepted, cross-checked against the
//! enrolled identity photo by an external face verifier.

pub mod clock;
pub mod frame;
pub mod gate;
pub mod identity;
pub mod machine;
pub mod orchestrator;
pub mod perception;
pub mod session;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use frame::{Frame, FrameError};
pub use gate::{GateVerdict, VerificationGate};
pub use identity::{IdentityReference, IdentitySlot};
pub use machine::{ChallengeOrder, ChallengePolicy, FrameOutcome, RejectReason};
pub use orchestrator::{ChallengeResult, Health, LivenessError, Orchestrator};
pub use perception::{
    DetectedFace, Detection, DetectorError, DetectorKind, FaceDetector, FaceVerifier,
    MatchScore, PerceptionAdapter, VerifierError,
};
pub use session::{BlinkState, ChallengeSession, IdMatch, PoseState, SessionStatus, TurnState};
pub use store::{SessionGuard, SessionHandle, SessionStore};
pub use types::{BoundingBox, Challenge, Direction, EyeState, FrameClassification, PoseClass};

//! Challenge state machine.
//!
//! Pure decision logic: given a session, one classified frame and the current
//! time, decide whether the frame advances the requested sub-challenge. The
//! only side effect is the `verify` callback, which the machine invokes at the
//! instant a transition is provisionally accepted and never otherwise.
//!
//! # Rules
//!
//! - **Blink:** registers on an observed `closed → open` transition, when the
//!   eyes stayed closed for at least `min_closed_duration` and the previous
//!   registration is at least `blink_debounce` old.
//! - **Turn:** a frontal frame can never satisfy a turn. A frame showing the
//!   target profile with at most `max_profile_eyes` visible eyes, at least
//!   `turn_debounce` after the last accepted profile frame, is handed to the
//!   verification gate; the turn completes only if the gate reports a match.
//! - A completed sub-challenge is final until the whole session is reset.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::gate::GateVerdict;
use crate::perception::MatchScore;
use crate::session::{ChallengeSession, IdMatch, PoseState};
use crate::types::{Challenge, Direction, EyeState, FrameClassification};

/// Whether sub-challenges must be completed in a fixed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeOrder {
    /// Any order across calls.
    #[default]
    Any,
    /// Blink, then left turn, then right turn.
    Fixed,
}

/// Timing windows and corroboration limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengePolicy {
    /// Shortest closed-eye interval that counts as a real blink.
    pub min_closed_duration: Duration,
    /// Minimum gap between two registered blinks.
    pub blink_debounce: Duration,
    /// Minimum gap between two accepted profile frames for the same turn.
    pub turn_debounce: Duration,
    /// A genuine profile shows at most this many eyes.
    pub max_profile_eyes: u32,
    pub order: ChallengeOrder,
    /// Frontal rejections after which a turn stops accepting frames.
    /// `None` only counts them.
    pub frontal_rejection_limit: Option<u32>,
    /// Also pass a registered blink through the verification gate.
    pub bind_blink_to_identity: bool,
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        Self {
            min_closed_duration: Duration::from_millis(50),
            blink_debounce: Duration::from_millis(200),
            turn_debounce: Duration::from_millis(300),
            max_profile_eyes: 1,
            order: ChallengeOrder::Any,
            frontal_rejection_limit: None,
            bind_blink_to_identity: false,
        }
    }
}

/// Machine-readable reason a frame did not advance its challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ClosedTooBriefly,
    BlinkDebounce,
    FacingCamera,
    WrongDirection,
    TooManyEyes,
    TurnDebounce,
    OutOfOrder,
    FrontalLimitReached,
    NoIdentityReference,
    NoFaceInVerification,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::ClosedTooBriefly => "closed_too_briefly",
            RejectReason::BlinkDebounce => "blink_debounce",
            RejectReason::FacingCamera => "facing_camera",
            RejectReason::WrongDirection => "wrong_direction",
            RejectReason::TooManyEyes => "too_many_eyes",
            RejectReason::TurnDebounce => "turn_debounce",
            RejectReason::OutOfOrder => "out_of_order",
            RejectReason::FrontalLimitReached => "frontal_limit_reached",
            RejectReason::NoIdentityReference => "no_identity_reference",
            RejectReason::NoFaceInVerification => "no_face_in_verification",
        }
    }

    /// Guidance suitable for showing to the user.
    pub fn message(self) -> &'static str {
        match self {
            RejectReason::ClosedTooBriefly => "Blink was too short to count. Blink naturally.",
            RejectReason::BlinkDebounce => "Blink already registered a moment ago.",
            RejectReason::FacingCamera => "You are facing the camera. Turn your head to the side.",
            RejectReason::WrongDirection => "Turn your head further in the requested direction.",
            RejectReason::TooManyEyes => "Both eyes are visible. Turn your head further.",
            RejectReason::TurnDebounce => "Hold the pose for a moment.",
            RejectReason::OutOfOrder => "Complete the previous step first.",
            RejectReason::FrontalLimitReached => "Too many attempts facing the camera.",
            RejectReason::NoIdentityReference => "No ID photo uploaded. Please upload your ID first.",
            RejectReason::NoFaceInVerification => "No face found. Please look at the camera.",
        }
    }
}

/// Result of applying one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FrameOutcome {
    /// The sub-challenge completed on this frame.
    Completed { score: Option<MatchScore> },
    /// The sub-challenge was already complete; nothing was evaluated.
    AlreadyCompleted,
    /// Frame observed and recorded, no transition yet.
    Pending,
    NoFaceDetected,
    Rejected { reason: RejectReason },
    /// The gate ran and the frame does not match the enrolled identity.
    IdentityMismatch { distance: f32, threshold: f32 },
    /// The gate could not reach a verdict; retrying may help.
    VerifierUnavailable { message: String },
}

impl FrameOutcome {
    fn rejected(reason: RejectReason) -> Self {
        FrameOutcome::Rejected { reason }
    }
}

/// Apply one classified frame to a session.
///
/// Always counts the frame. `verify` is called at most once, and only when a
/// transition is provisionally accepted.
pub fn apply(
    mut session: ChallengeSession,
    challenge: Challenge,
    classification: &FrameClassification,
    now: Instant,
    policy: &ChallengePolicy,
    verify: impl FnOnce() -> GateVerdict,
) -> (ChallengeSession, FrameOutcome) {
    session.frame_count += 1;
    session.last_activity_at = now;

    if session.is_completed(challenge) {
        return (session, FrameOutcome::AlreadyCompleted);
    }
    if policy.order == ChallengeOrder::Fixed && !prerequisites_met(&session, challenge) {
        return (session, FrameOutcome::rejected(RejectReason::OutOfOrder));
    }
    if !classification.face_detected {
        return (session, FrameOutcome::NoFaceDetected);
    }

    let outcome = match challenge {
        Challenge::Blink => step_blink(&mut session, classification, now, policy, verify),
        Challenge::Turn(dir) => step_turn(&mut session, dir, classification, now, policy, verify),
    };
    (session, outcome)
}

fn prerequisites_met(session: &ChallengeSession, challenge: Challenge) -> bool {
    match challenge {
        Challenge::Blink => true,
        Challenge::Turn(Direction::Left) => session.blink.completed,
        Challenge::Turn(Direction::Right) => session.blink.completed && session.left_turn.completed,
    }
}

fn step_blink(
    session: &mut ChallengeSession,
    c: &FrameClassification,
    now: Instant,
    policy: &ChallengePolicy,
    verify: impl FnOnce() -> GateVerdict,
) -> FrameOutcome {
    let blink = &mut session.blink;
    let previous = blink.previous_eye_state;
    blink.previous_eye_state = c.eye_state;

    match (previous, c.eye_state) {
        (prev, EyeState::Closed) => {
            if prev != EyeState::Closed {
                blink.last_closed_at = Some(now);
            }
            FrameOutcome::Pending
        }
        (EyeState::Closed, EyeState::Open) => {
            let closed_long_enough = blink
                .last_closed_at
                .is_some_and(|t| now.saturating_duration_since(t) >= policy.min_closed_duration);
            if !closed_long_enough {
                return FrameOutcome::rejected(RejectReason::ClosedTooBriefly);
            }
            if blink
                .last_blink_at
                .is_some_and(|t| now.saturating_duration_since(t) < policy.blink_debounce)
            {
                return FrameOutcome::rejected(RejectReason::BlinkDebounce);
            }

            blink.last_blink_at = Some(now);
            if policy.bind_blink_to_identity {
                resolve(session, Challenge::Blink, verify())
            } else {
                blink.completed = true;
                FrameOutcome::Completed { score: None }
            }
        }
        _ => FrameOutcome::Pending,
    }
}

fn step_turn(
    session: &mut ChallengeSession,
    direction: Direction,
    c: &FrameClassification,
    now: Instant,
    policy: &ChallengePolicy,
    verify: impl FnOnce() -> GateVerdict,
) -> FrameOutcome {
    let turn = session.turn_mut(direction);

    if let Some(limit) = policy.frontal_rejection_limit {
        if turn.frontal_rejection_count >= limit {
            return FrameOutcome::rejected(RejectReason::FrontalLimitReached);
        }
    }

    if c.pose_is_frontal {
        turn.frontal_rejection_count += 1;
        turn.previous_pose_state = PoseState::Frontal;
        return FrameOutcome::rejected(RejectReason::FacingCamera);
    }

    if c.pose_class != direction.target_pose() {
        turn.previous_pose_state = PoseState::Frontal;
        return FrameOutcome::rejected(RejectReason::WrongDirection);
    }
    turn.previous_pose_state = PoseState::Profile;

    if c.eye_count > policy.max_profile_eyes {
        return FrameOutcome::rejected(RejectReason::TooManyEyes);
    }
    if turn
        .last_transition_at
        .is_some_and(|t| now.saturating_duration_since(t) < policy.turn_debounce)
    {
        return FrameOutcome::rejected(RejectReason::TurnDebounce);
    }

    turn.last_transition_at = Some(now);
    resolve(session, Challenge::Turn(direction), verify())
}

/// Bind a gate verdict into the session. Only a match completes the step.
fn resolve(
    session: &mut ChallengeSession,
    challenge: Challenge,
    verdict: GateVerdict,
) -> FrameOutcome {
    match verdict {
        GateVerdict::Matched {
            score,
            reference_digest,
        } => {
            match challenge {
                Challenge::Blink => session.blink.completed = true,
                Challenge::Turn(dir) => session.turn_mut(dir).completed = true,
            }
            session.id_match = Some(IdMatch {
                verified: true,
                distance: Some(score.distance),
                threshold: Some(score.threshold),
                challenge,
                reference_digest,
            });
            FrameOutcome::Completed { score: Some(score) }
        }
        GateVerdict::Mismatch(score) => FrameOutcome::IdentityMismatch {
            distance: score.distance,
            threshold: score.threshold,
        },
        GateVerdict::NoReference => FrameOutcome::rejected(RejectReason::NoIdentityReference),
        GateVerdict::NoFace(_) => FrameOutcome::rejected(RejectReason::NoFaceInVerification),
        GateVerdict::Unavailable(message) => FrameOutcome::VerifierUnavailable { message },
    }
}

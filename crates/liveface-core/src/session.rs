use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::types::{Challenge, Direction, EyeState};

/// Blink sub-challenge progress.
#[derive(Debug, Clone, PartialEq)]
pub struct BlinkState {
    pub completed: bool,
    pub previous_eye_state: EyeState,
    pub last_closed_at: Option<Instant>,
    pub last_blink_at: Option<Instant>,
}

impl Default for BlinkState {
    fn default() -> Self {
        Self {
            completed: false,
            previous_eye_state: EyeState::Unknown,
            last_closed_at: None,
            last_blink_at: None,
        }
    }
}

/// Last pose observed for a turn sub-challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoseState {
    #[default]
    Frontal,
    Profile,
}

/// Head-turn sub-challenge progress (one per direction).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnState {
    pub completed: bool,
    pub previous_pose_state: PoseState,
    pub last_transition_at: Option<Instant>,
    pub frontal_rejection_count: u32,
}

/// Snapshot of the verification gate result that completed a sub-challenge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdMatch {
    pub verified: bool,
    pub distance: Option<f32>,
    pub threshold: Option<f32>,
    /// Sub-challenge whose frame was verified.
    pub challenge: Challenge,
    /// Digest of the identity reference the frame was scored against.
    pub reference_digest: String,
}

/// Per-attempt challenge state.
#[derive(Debug, Clone)]
pub struct ChallengeSession {
    id: String,
    /// Time of creation or of the last committed frame. Idle expiry is
    /// measured from here, not from creation.
    pub last_activity_at: Instant,
    pub started_at: DateTime<Utc>,
    pub frame_count: u64,
    pub blink: BlinkState,
    pub left_turn: TurnState,
    pub right_turn: TurnState,
    pub id_match: Option<IdMatch>,
}

impl ChallengeSession {
    pub fn new(id: impl Into<String>, now: Instant) -> Self {
        Self {
            id: id.into(),
            last_activity_at: now,
            started_at: Utc::now(),
            frame_count: 0,
            blink: BlinkState::default(),
            left_turn: TurnState::default(),
            right_turn: TurnState::default(),
            id_match: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn turn(&self, direction: Direction) -> &TurnState {
        match direction {
            Direction::Left => &self.left_turn,
            Direction::Right => &self.right_turn,
        }
    }

    pub fn turn_mut(&mut self, direction: Direction) -> &mut TurnState {
        match direction {
            Direction::Left => &mut self.left_turn,
            Direction::Right => &mut self.right_turn,
        }
    }

    pub fn is_completed(&self, challenge: Challenge) -> bool {
        match challenge {
            Challenge::Blink => self.blink.completed,
            Challenge::Turn(dir) => self.turn(dir).completed,
        }
    }

    pub fn liveness_complete(&self) -> bool {
        self.blink.completed && self.left_turn.completed && self.right_turn.completed
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            started_at: self.started_at,
            frame_count: self.frame_count,
            blink: BlinkStatus {
                completed: self.blink.completed,
                previous_eye_state: self.blink.previous_eye_state,
            },
            left_turn: TurnStatus::from(&self.left_turn),
            right_turn: TurnStatus::from(&self.right_turn),
            id_match: self.id_match.clone(),
            liveness_complete: self.liveness_complete(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlinkStatus {
    pub completed: bool,
    pub previous_eye_state: EyeState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnStatus {
    pub completed: bool,
    pub previous_pose_state: PoseState,
    pub frontal_rejection_count: u32,
}

impl From<&TurnState> for TurnStatus {
    fn from(t: &TurnState) -> Self {
        Self {
            completed: t.completed,
            previous_pose_state: t.previous_pose_state,
            frontal_rejection_count: t.frontal_rejection_count,
        }
    }
}

/// Caller-facing view of a session, serializable for transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub frame_count: u64,
    pub blink: BlinkStatus,
    pub left_turn: TurnStatus,
    pub right_turn: TurnStatus,
    pub id_match: Option<IdMatch>,
    pub liveness_complete: bool,
}

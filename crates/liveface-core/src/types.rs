use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned face box in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center_x(&self) -> f32 {
        self.x + self.width / 2.0
    }
}

/// Observed eye state for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EyeState {
    /// No face-bearing frame has been seen yet.
    Unknown,
    Open,
    Closed,
}

/// Head-pose class assigned by the perception adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseClass {
    Frontal,
    LeftProfile,
    RightProfile,
    SlightTurn,
    Unknown,
}

/// Head-turn direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// The profile pose that proves a turn in this direction.
    pub fn target_pose(self) -> PoseClass {
        match self {
            Direction::Left => PoseClass::LeftProfile,
            Direction::Right => PoseClass::RightProfile,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            other => Err(format!("unknown direction '{other}' (expected left or right)")),
        }
    }
}

/// Which sub-challenge a frame is submitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Challenge {
    Blink,
    Turn(Direction),
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::Blink => f.write_str("blink"),
            Challenge::Turn(dir) => write!(f, "{}_turn", dir.as_str()),
        }
    }
}

/// Normalized per-frame output of the perception adapter.
///
/// Ephemeral: consumed by exactly one state-machine step and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameClassification {
    pub face_detected: bool,
    pub eye_state: EyeState,
    pub eye_count: u32,
    pub pose_class: PoseClass,
    pub pose_is_frontal: bool,
}

impl FrameClassification {
    /// Classification used when the detector finds nothing (or fails).
    ///
    /// Eyes default to open so a missing face can never look like the
    /// closed half of a blink.
    pub fn no_face() -> Self {
        Self {
            face_detected: false,
            eye_state: EyeState::Open,
            eye_count: 0,
            pose_class: PoseClass::Unknown,
            pose_is_frontal: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("Left".parse::<Direction>().unwrap(), Direction::Left);
        assert_eq!("RIGHT".parse::<Direction>().unwrap(), Direction::Right);
        assert!("up".parse::<Direction>().is_err());
    }

    #[test]
    fn challenge_display_is_stable() {
        assert_eq!(Challenge::Blink.to_string(), "blink");
        assert_eq!(Challenge::Turn(Direction::Left).to_string(), "left_turn");
        assert_eq!(Challenge::Turn(Direction::Right).to_string(), "right_turn");
    }

    #[test]
    fn bounding_box_geometry() {
        let b = BoundingBox {
            x: 10.0,
            y: 0.0,
            width: 20.0,
            height: 30.0,
        };
        assert_eq!(b.area(), 600.0);
        assert_eq!(b.center_x(), 20.0);
    }
}

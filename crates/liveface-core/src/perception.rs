//! Contracts for the external face detector and face verifier, and the
//! adapter that turns raw detector findings into a [`FrameClassification`].
//!
//! Whatever retry or fallback strategy a detector uses internally (several
//! cascades, progressively more lenient parameters) stays behind
//! [`FaceDetector::detect`]. The state machine only ever sees the normalized
//! classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Frame;
use crate::identity::IdentityReference;
use crate::types::{BoundingBox, EyeState, FrameClassification, PoseClass};

/// Horizontal offset beyond which a one-eyed face counts as a clear profile.
const PROFILE_SHIFT: f32 = 0.15;
/// Weaker offset used when exactly one eye is visible.
const ONE_EYE_SHIFT: f32 = 0.05;
/// Offset beyond which a frontal box with fewer than two eyes is a slight turn.
const SLIGHT_TURN_SHIFT: f32 = 0.1;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detector returned malformed output: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifierError {
    /// No face could be found in the live frame or the reference image.
    #[error("no face found for verification: {0}")]
    NoFace(String),
    /// The verification engine itself failed.
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// Which detector model produced a face box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Frontal,
    LeftProfile,
    RightProfile,
}

/// One face found in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub kind: DetectorKind,
    pub bbox: BoundingBox,
    /// Eyes found in the upper part of the face box.
    pub eyes: u32,
}

/// Raw detector output for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub faces: Vec<DetectedFace>,
}

/// Face verifier score for one reference/live pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub matched: bool,
    pub distance: f32,
    pub threshold: f32,
}

/// Face/eye/pose detector. Must be deterministic for identical pixels and
/// must not mutate its input.
pub trait FaceDetector: Send + Sync + 'static {
    fn detect(&self, frame: &Frame) -> Result<Detection, DetectorError>;
}

/// Identity face matcher.
pub trait FaceVerifier: Send + Sync + 'static {
    fn compare(
        &self,
        reference: &IdentityReference,
        live: &Frame,
    ) -> Result<MatchScore, VerifierError>;
}

/// Wraps a [`FaceDetector`] and normalizes its findings.
pub struct PerceptionAdapter<D> {
    detector: D,
}

impl<D: FaceDetector> PerceptionAdapter<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    /// Classify one frame. Detector failures degrade to "no face".
    pub fn classify(&self, frame: &Frame) -> FrameClassification {
        match self.detector.detect(frame) {
            Ok(detection) => normalize(&detection, frame.width),
            Err(e) => {
                tracing::warn!(error = %e, "detector failed; treating frame as faceless");
                FrameClassification::no_face()
            }
        }
    }

    /// Whether the detector finds any face at all. Used to validate identity
    /// photos before they are accepted as a reference.
    pub fn has_face(&self, frame: &Frame) -> Result<bool, DetectorError> {
        Ok(!self.detector.detect(frame)?.faces.is_empty())
    }
}

/// Collapse raw detections into a single classification.
///
/// The largest face box wins. Pose is decided from the detector kind, the
/// number of visible eyes and how far the face sits from the image centre.
pub fn normalize(detection: &Detection, image_width: u32) -> FrameClassification {
    let Some(face) = detection
        .faces
        .iter()
        .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
    else {
        return FrameClassification::no_face();
    };

    let eyes = face.eyes;
    let shift = if image_width == 0 {
        0.0
    } else {
        let half = image_width as f32 / 2.0;
        (face.bbox.center_x() - half) / half
    };

    let (pose_class, pose_is_frontal) = if eyes >= 2 && face.kind == DetectorKind::Frontal {
        (PoseClass::Frontal, true)
    } else if face.kind == DetectorKind::LeftProfile || (eyes <= 1 && shift > PROFILE_SHIFT) {
        (PoseClass::LeftProfile, false)
    } else if face.kind == DetectorKind::RightProfile || (eyes <= 1 && shift < -PROFILE_SHIFT) {
        (PoseClass::RightProfile, false)
    } else if eyes == 1 {
        let pose = if shift > ONE_EYE_SHIFT {
            PoseClass::LeftProfile
        } else if shift < -ONE_EYE_SHIFT {
            PoseClass::RightProfile
        } else {
            PoseClass::SlightTurn
        };
        (pose, false)
    } else if face.kind == DetectorKind::Frontal {
        let pose = if shift.abs() > SLIGHT_TURN_SHIFT {
            PoseClass::SlightTurn
        } else {
            PoseClass::Frontal
        };
        (pose, false)
    } else {
        (PoseClass::SlightTurn, false)
    };

    FrameClassification {
        face_detected: true,
        eye_state: if eyes >= 2 {
            EyeState::Open
        } else {
            EyeState::Closed
        },
        eye_count: eyes,
        pose_class,
        pose_is_frontal,
    }
}

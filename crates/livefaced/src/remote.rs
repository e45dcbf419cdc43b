//! HTTP client for the perception service that hosts the face detector and
//! face verifier models.
//!
//! `POST {base}/detect` takes raw image bytes and answers with every face box
//! found. `POST {base}/verify` takes the reference and live images packed as
//! `u32 LE reference length || reference || live` and answers with a score,
//! or with `{"error": "no_face", ...}` when either image has no usable face.

use std::time::Duration;

use liveface_core::{
    BoundingBox, DetectedFace, Detection, DetectorError, DetectorKind, FaceDetector,
    FaceVerifier, Frame, IdentityReference, MatchScore, VerifierError,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("perception request failed: {0}")]
    Http(#[from] ureq::Error),
    #[error("perception service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reference image too large ({0} bytes)")]
    ReferenceTooLarge(usize),
}

#[derive(Debug, Deserialize)]
struct WireFace {
    kind: DetectorKind,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    #[serde(default)]
    eyes: u32,
}

#[derive(Debug, Deserialize)]
struct DetectReply {
    #[serde(default)]
    faces: Vec<WireFace>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VerifyReply {
    Score {
        matched: bool,
        distance: f32,
        threshold: f32,
    },
    Failure {
        error: String,
        #[serde(default)]
        message: String,
    },
}

impl From<DetectReply> for Detection {
    fn from(reply: DetectReply) -> Self {
        Detection {
            faces: reply
                .faces
                .into_iter()
                .map(|f| DetectedFace {
                    kind: f.kind,
                    bbox: BoundingBox {
                        x: f.x,
                        y: f.y,
                        width: f.width,
                        height: f.height,
                    },
                    eyes: f.eyes,
                })
                .collect(),
        }
    }
}

fn interpret_verify(success: bool, reply: VerifyReply) -> Result<MatchScore, VerifierError> {
    match reply {
        VerifyReply::Score {
            matched,
            distance,
            threshold,
        } if success => Ok(MatchScore {
            matched,
            distance,
            threshold,
        }),
        VerifyReply::Score { .. } => Err(VerifierError::Unavailable(
            "score returned with an error status".into(),
        )),
        VerifyReply::Failure { error, message } if error == "no_face" => {
            Err(VerifierError::NoFace(message))
        }
        VerifyReply::Failure { error, message } => {
            Err(VerifierError::Unavailable(format!("{error}: {message}")))
        }
    }
}

/// Packs the verify request body.
fn verify_body(reference: &[u8], live: &[u8]) -> Result<Vec<u8>, RemoteError> {
    let len = u32::try_from(reference.len())
        .map_err(|_| RemoteError::ReferenceTooLarge(reference.len()))?;
    let mut body = Vec::with_capacity(4 + reference.len() + live.len());
    body.extend_from_slice(&len.to_le_bytes());
    body.extend_from_slice(reference);
    body.extend_from_slice(live);
    Ok(body)
}

/// Blocking client for the perception service. Implements both perception
/// contracts; the core calls it from blocking worker threads.
#[derive(Clone)]
pub struct RemotePerception {
    base_url: String,
    agent: ureq::Agent,
}

impl RemotePerception {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: config.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str, body: &[u8]) -> Result<ureq::http::Response<ureq::Body>, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .agent
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .send(body)?;
        Ok(resp)
    }

    fn detect_remote(&self, frame: &Frame) -> Result<DetectReply, RemoteError> {
        let mut resp = self.post("/detect", frame.bytes())?;
        if !resp.status().is_success() {
            return Err(RemoteError::Status {
                status: resp.status().as_u16(),
                body: resp.body_mut().read_to_string().unwrap_or_default(),
            });
        }
        Ok(resp.body_mut().read_json::<DetectReply>()?)
    }
}

impl FaceDetector for RemotePerception {
    fn detect(&self, frame: &Frame) -> Result<Detection, DetectorError> {
        match self.detect_remote(frame) {
            Ok(reply) => Ok(reply.into()),
            Err(RemoteError::Http(ureq::Error::Json(e))) => {
                Err(DetectorError::Malformed(e.to_string()))
            }
            Err(e) => Err(DetectorError::Unavailable(e.to_string())),
        }
    }
}

impl FaceVerifier for RemotePerception {
    fn compare(
        &self,
        reference: &IdentityReference,
        live: &Frame,
    ) -> Result<MatchScore, VerifierError> {
        let unavailable = |e: RemoteError| VerifierError::Unavailable(e.to_string());

        let body = verify_body(reference.frame.bytes(), live.bytes()).map_err(unavailable)?;
        let mut resp = self.post("/verify", &body).map_err(unavailable)?;
        let success = resp.status().is_success();
        let reply = resp
            .body_mut()
            .read_json::<VerifyReply>()
            .map_err(|e| unavailable(RemoteError::Http(e)))?;
        interpret_verify(success, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_reply_maps_to_detection() {
        let reply: DetectReply = serde_json::from_str(
            r#"{"faces":[
                {"kind":"frontal","x":10,"y":20,"width":100,"height":120,"eyes":2},
                {"kind":"left_profile","x":300,"y":40,"width":80,"height":90}
            ]}"#,
        )
        .unwrap();
        let detection: Detection = reply.into();
        assert_eq!(detection.faces.len(), 2);
        assert_eq!(detection.faces[0].kind, DetectorKind::Frontal);
        assert_eq!(detection.faces[0].bbox.center_x(), 60.0);
        assert_eq!(detection.faces[0].eyes, 2);
        assert_eq!(detection.faces[1].kind, DetectorKind::LeftProfile);
        assert_eq!(detection.faces[1].eyes, 0);
    }

    #[test]
    fn empty_detect_reply_has_no_faces() {
        let reply: DetectReply = serde_json::from_str("{}").unwrap();
        assert!(Detection::from(reply).faces.is_empty());
    }

    #[test]
    fn unknown_detector_kind_is_rejected() {
        let parsed = serde_json::from_str::<DetectReply>(
            r#"{"faces":[{"kind":"upside_down","x":0,"y":0,"width":1,"height":1}]}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn verify_body_is_length_prefixed() {
        let body = verify_body(b"ref", b"live!").unwrap();
        assert_eq!(&body[..4], &3u32.to_le_bytes());
        assert_eq!(&body[4..7], b"ref");
        assert_eq!(&body[7..], b"live!");
    }

    fn reply(json: &str) -> VerifyReply {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn verify_score_is_passed_through() {
        let score = interpret_verify(
            true,
            reply(r#"{"matched":false,"distance":0.81,"threshold":0.68}"#),
        )
        .unwrap();
        assert!(!score.matched);
        assert_eq!(score.distance, 0.81);
        assert_eq!(score.threshold, 0.68);
    }

    #[test]
    fn verify_no_face_is_distinct_from_outage() {
        let no_face = interpret_verify(
            false,
            reply(r#"{"error":"no_face","message":"no face in live image"}"#),
        );
        assert_eq!(
            no_face,
            Err(VerifierError::NoFace("no face in live image".into()))
        );

        let outage = interpret_verify(false, reply(r#"{"error":"model_not_loaded"}"#));
        assert!(matches!(outage, Err(VerifierError::Unavailable(_))));
    }

    #[test]
    fn score_with_error_status_is_an_outage() {
        let result = interpret_verify(
            false,
            reply(r#"{"matched":true,"distance":0.1,"threshold":0.68}"#),
        );
        assert!(matches!(result, Err(VerifierError::Unavailable(_))));
    }

    #[test]
    fn unreachable_service_degrades_cleanly() {
        // Port 9 (discard) on localhost is closed in test environments
        let remote = RemotePerception::new("http://127.0.0.1:9/", Duration::from_millis(500));
        assert_eq!(remote.base_url(), "http://127.0.0.1:9");

        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        let frame = Frame::decode(&buf).unwrap();

        assert!(matches!(
            remote.detect(&frame),
            Err(DetectorError::Unavailable(_))
        ));
        let reference = IdentityReference::new(frame.clone());
        assert!(matches!(
            remote.compare(&reference, &frame),
            Err(VerifierError::Unavailable(_))
        ));
    }
}

use crate::frame::Frame;
use crate::identity::IdentityReference;
use crate::perception::{FaceVerifier, MatchScore, VerifierError};

/// Outcome of one identity cross-check.
///
/// Every variant other than [`GateVerdict::Matched`] is a non-match; they are
/// kept apart so callers can tell "no face" from "wrong face" from "engine
/// down".
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Matched {
        score: MatchScore,
        reference_digest: String,
    },
    Mismatch(MatchScore),
    /// Nothing has been enrolled to compare against.
    NoReference,
    /// The verifier could not find a face to compare.
    NoFace(String),
    /// The verifier errored; the caller may retry.
    Unavailable(String),
}

impl GateVerdict {
    pub fn is_match(&self) -> bool {
        matches!(self, GateVerdict::Matched { .. })
    }
}

/// Cross-checks a just-accepted challenge frame against the enrolled identity.
///
/// Only invoked when a transition is provisionally accepted, never per frame.
pub struct VerificationGate<V> {
    verifier: V,
}

impl<V: FaceVerifier> VerificationGate<V> {
    pub fn new(verifier: V) -> Self {
        Self { verifier }
    }

    pub fn check(&self, frame: &Frame, reference: Option<&IdentityReference>) -> GateVerdict {
        let Some(reference) = reference else {
            tracing::warn!("gate: no identity reference enrolled");
            return GateVerdict::NoReference;
        };

        match self.verifier.compare(reference, frame) {
            Ok(score) if score.matched => {
                tracing::info!(
                    distance = score.distance,
                    threshold = score.threshold,
                    "gate: identity match"
                );
                GateVerdict::Matched {
                    score,
                    reference_digest: reference.digest.clone(),
                }
            }
            Ok(score) => {
                tracing::info!(
                    distance = score.distance,
                    threshold = score.threshold,
                    "gate: identity mismatch"
                );
                GateVerdict::Mismatch(score)
            }
            Err(VerifierError::NoFace(msg)) => {
                tracing::warn!(error = %msg, "gate: verifier found no face");
                GateVerdict::NoFace(msg)
            }
            Err(VerifierError::Unavailable(msg)) => {
                tracing::error!(error = %msg, "gate: verifier unavailable");
                GateVerdict::Unavailable(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_support::png_bytes;

    struct Fixed(Result<MatchScore, VerifierError>);

    impl FaceVerifier for Fixed {
        fn compare(
            &self,
            _reference: &IdentityReference,
            _live: &Frame,
        ) -> Result<MatchScore, VerifierError> {
            self.0.clone()
        }
    }

    fn frame() -> Frame {
        Frame::decode(&png_bytes(8, 8)).unwrap()
    }

    fn score(matched: bool) -> MatchScore {
        MatchScore {
            matched,
            distance: if matched { 0.3 } else { 0.9 },
            threshold: 0.68,
        }
    }

    #[test]
    fn missing_reference_is_its_own_verdict() {
        let gate = VerificationGate::new(Fixed(Ok(score(true))));
        assert_eq!(gate.check(&frame(), None), GateVerdict::NoReference);
    }

    #[test]
    fn match_carries_reference_digest() {
        let gate = VerificationGate::new(Fixed(Ok(score(true))));
        let reference = IdentityReference::new(frame());
        match gate.check(&frame(), Some(&reference)) {
            GateVerdict::Matched {
                score,
                reference_digest,
            } => {
                assert!(score.matched);
                assert_eq!(reference_digest, reference.digest);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn failures_stay_distinct() {
        let reference = IdentityReference::new(frame());

        let gate = VerificationGate::new(Fixed(Ok(score(false))));
        assert_eq!(
            gate.check(&frame(), Some(&reference)),
            GateVerdict::Mismatch(score(false))
        );

        let gate = VerificationGate::new(Fixed(Err(VerifierError::NoFace("mtcnn".into()))));
        assert!(matches!(
            gate.check(&frame(), Some(&reference)),
            GateVerdict::NoFace(_)
        ));

        let gate = VerificationGate::new(Fixed(Err(VerifierError::Unavailable("down".into()))));
        let verdict = gate.check(&frame(), Some(&reference));
        assert!(matches!(verdict, GateVerdict::Unavailable(_)));
        assert!(!verdict.is_match());
    }
}

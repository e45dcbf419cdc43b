use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Identity mismatches tolerated before lockout.
const MAX_MISMATCHES: u32 = 5;
/// Window over which mismatches are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Lockout duration after reaching MAX_MISMATCHES.
const LOCKOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Refused {
    #[error("too many identity mismatches; try again in {remaining_secs}s")]
    Locked { remaining_secs: u64 },
    #[error("too many verification attempts in progress; try again shortly")]
    Saturated,
}

/// How a reserved attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The gate scored the frame as a different person.
    Mismatch,
    /// The gate confirmed the identity.
    Matched,
    /// Anything else: rejected before the gate, verifier outage, bad input.
    Other,
}

struct IdentityRecord {
    mismatches: u32,
    in_flight: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl IdentityRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            mismatches: 0,
            in_flight: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Limiter for frames that fail the identity cross-check, keyed by the
/// digest of the enrolled reference.
///
/// After MAX_MISMATCHES identity mismatches within WINDOW no frame may be
/// submitted for LOCKOUT, whatever session id it carries. Every frame holds a
/// reservation while it is processed, and reservations count against the
/// remaining budget, so concurrent frames can never push the mismatch count
/// past the limit. Verifier outages and ordinary challenge rejections are not
/// counted.
pub struct MismatchLimiter {
    records: HashMap<String, IdentityRecord>,
}

impl MismatchLimiter {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Reserve one attempt against `key` at `now`.
    pub fn begin(&mut self, key: &str, now: Instant) -> Result<(), Refused> {
        let record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| IdentityRecord::fresh(now));

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(Refused::Locked {
                    remaining_secs: locked_until.duration_since(now).as_secs().max(1),
                });
            }
            record.locked_until = None;
            record.mismatches = 0;
            record.window_start = now;
        } else if now.saturating_duration_since(record.window_start) >= WINDOW {
            record.mismatches = 0;
            record.window_start = now;
        }

        if record.mismatches + record.in_flight >= MAX_MISMATCHES {
            return Err(Refused::Saturated);
        }
        record.in_flight += 1;
        Ok(())
    }

    /// Release a reservation taken with [`begin`](Self::begin).
    pub fn finish(&mut self, key: &str, attempt: Attempt, now: Instant) {
        let Some(record) = self.records.get_mut(key) else {
            return;
        };
        record.in_flight = record.in_flight.saturating_sub(1);

        match attempt {
            Attempt::Mismatch => {
                if record.locked_until.is_none()
                    && now.saturating_duration_since(record.window_start) >= WINDOW
                {
                    record.mismatches = 0;
                    record.window_start = now;
                }
                record.mismatches += 1;
                if record.mismatches >= MAX_MISMATCHES && record.locked_until.is_none() {
                    record.locked_until = Some(now + LOCKOUT);
                    tracing::warn!(
                        identity = key,
                        mismatches = record.mismatches,
                        lockout_secs = LOCKOUT.as_secs(),
                        "mismatch limit reached; locking identity"
                    );
                } else {
                    tracing::debug!(
                        identity = key,
                        mismatches = record.mismatches,
                        max = MAX_MISMATCHES,
                        "identity mismatch recorded"
                    );
                }
            }
            Attempt::Matched if record.locked_until.is_none() => {
                record.mismatches = 0;
                record.window_start = now;
            }
            Attempt::Matched | Attempt::Other => {}
        }
    }

    /// Drop idle records whose window and lockout have both lapsed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| {
            r.in_flight > 0
                || match r.locked_until {
                    Some(until) => now < until,
                    None => r.mismatches > 0 && now.saturating_duration_since(r.window_start) < WINDOW,
                }
        });
        before - self.records.len()
    }
}

impl Default for MismatchLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe limiter handing out reservations that release on drop.
#[derive(Clone, Default)]
pub struct SharedLimiter {
    inner: Arc<Mutex<MismatchLimiter>>,
}

/// One reserved attempt. Dropping it without [`finish`](Self::finish)
/// releases the reservation as [`Attempt::Other`].
pub struct Permit {
    limiter: SharedLimiter,
    key: String,
    finished: bool,
}

impl SharedLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MismatchLimiter> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self, key: &str, now: Instant) -> Result<Permit, Refused> {
        self.lock().begin(key, now)?;
        Ok(Permit {
            limiter: self.clone(),
            key: key.to_string(),
            finished: false,
        })
    }

    pub fn prune(&self, now: Instant) -> usize {
        self.lock().prune(now)
    }
}

impl Permit {
    pub fn finish(mut self, attempt: Attempt, now: Instant) {
        self.finished = true;
        self.limiter.lock().finish(&self.key, attempt, now);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.finished {
            self.limiter
                .lock()
                .finish(&self.key, Attempt::Other, Instant::now());
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use liveface_core::{ChallengeOrder, ChallengePolicy};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the perception service (detector + verifier).
    pub perception_url: String,
    /// Timeout in seconds for one perception request.
    pub perception_timeout_secs: u64,
    /// Path to the SQLite database holding the identity reference.
    pub db_path: PathBuf,
    /// Sessions with no frame for this long are evicted.
    pub session_idle_secs: u64,
    /// How often the idle sweeper runs.
    pub sweep_interval_secs: u64,
    pub min_closed_ms: u64,
    pub blink_debounce_ms: u64,
    pub turn_debounce_ms: u64,
    /// Require blink, then left turn, then right turn.
    pub enforce_order: bool,
    /// Frontal rejections after which a turn stops accepting frames.
    pub frontal_limit: Option<u32>,
    /// Run accepted blinks through the identity gate as well.
    pub bind_blink: bool,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Config {
    /// Load configuration from `LIVEFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("liveface");

        let db_path = var("LIVEFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("identity.db"));

        Self {
            perception_url: var("LIVEFACE_PERCEPTION_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "http://127.0.0.1:8500".to_string()),
            perception_timeout_secs: parse_or(&var, "LIVEFACE_PERCEPTION_TIMEOUT_SECS", 5),
            db_path,
            session_idle_secs: parse_or(&var, "LIVEFACE_SESSION_IDLE_SECS", 600),
            sweep_interval_secs: parse_or(&var, "LIVEFACE_SWEEP_INTERVAL_SECS", 60).max(1),
            min_closed_ms: parse_or(&var, "LIVEFACE_MIN_CLOSED_MS", 50),
            blink_debounce_ms: parse_or(&var, "LIVEFACE_BLINK_DEBOUNCE_MS", 200),
            turn_debounce_ms: parse_or(&var, "LIVEFACE_TURN_DEBOUNCE_MS", 300),
            enforce_order: flag(&var, "LIVEFACE_ENFORCE_ORDER"),
            frontal_limit: var("LIVEFACE_FRONTAL_LIMIT").and_then(|v| v.parse().ok()),
            bind_blink: flag(&var, "LIVEFACE_BIND_BLINK"),
            session_bus: var("LIVEFACE_SESSION_BUS").is_some(),
            log_json: flag(&var, "LIVEFACE_LOG_JSON"),
        }
    }

    /// Challenge timing and corroboration rules derived from this config.
    pub fn policy(&self) -> ChallengePolicy {
        ChallengePolicy {
            min_closed_duration: Duration::from_millis(self.min_closed_ms),
            blink_debounce: Duration::from_millis(self.blink_debounce_ms),
            turn_debounce: Duration::from_millis(self.turn_debounce_ms),
            order: if self.enforce_order {
                ChallengeOrder::Fixed
            } else {
                ChallengeOrder::Any
            },
            frontal_rejection_limit: self.frontal_limit,
            bind_blink_to_identity: self.bind_blink,
            ..ChallengePolicy::default()
        }
    }

    pub fn perception_timeout(&self) -> Duration {
        Duration::from_secs(self.perception_timeout_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Boolean switch: set and not "0".
fn flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    var(key).map(|v| v != "0" && !v.is_empty()).unwrap_or(false)
}

use std::time::Duration as StdDuration;

use chrono::Duration;

/// Engine configuration, read once at startup from the environment.
///
/// Optional limits accept an integer, or `none`/empty to disable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `GOALS_DATABASE_URL`, falling back to `DATABASE_URL`.
    pub database_url: String,
    /// A goal with this many progress entries is forced into GIVEN_UP.
    pub max_progress_count: i64,
    /// Achieved goals older than this are garbage collected. `None` disables
    /// the sweeper.
    pub retention_seconds: Option<i64>,
    /// Deadline applied to scheduled goals that do not specify one.
    pub default_deadline_seconds: i64,
    /// Process-wide address-space cap for workers.
    pub memory_limit_mib: Option<u64>,
    /// Wall-time cap per handler invocation.
    pub time_limit_seconds: Option<u64>,
    /// Tracking entries at which a goal is considered to be killing workers.
    pub max_pickups: i64,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = get("GOALS_DATABASE_URL")
            .or_else(|| get("DATABASE_URL"))
            .ok_or_else(|| {
                anyhow::anyhow!("GOALS_DATABASE_URL (or DATABASE_URL) must be set")
            })?;

        Ok(Self {
            database_url,
            max_progress_count: required_int(&get, "GOALS_MAX_PROGRESS_COUNT", 100)?,
            retention_seconds: optional_int(&get, "GOALS_RETENTION_SECONDS", Some(604_800))?,
            default_deadline_seconds: required_int(
                &get,
                "GOALS_DEFAULT_DEADLINE_SECONDS",
                604_800,
            )?,
            memory_limit_mib: optional_int(&get, "GOALS_MEMORY_LIMIT_MIB", None)?
                .map(|v| v as u64),
            time_limit_seconds: optional_int(&get, "GOALS_TIME_LIMIT_SECONDS", None)?
                .map(|v| v as u64),
            max_pickups: required_int(&get, "GOALS_MAX_PICKUPS", 3)?,
        })
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_seconds.map(Duration::seconds)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::seconds(self.default_deadline_seconds)
    }

    pub fn time_limit(&self) -> Option<StdDuration> {
        self.time_limit_seconds.map(StdDuration::from_secs)
    }
}

fn required_int(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
) -> anyhow::Result<i64> {
    match get(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", key, raw, e)),
    }
}

fn optional_int(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Option<i64>,
) -> anyhow::Result<Option<i64>> {
    match get(key) {
        None => Ok(default),
        Some(raw) => {
            let raw = raw.trim();
            if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
                return Ok(None);
            }
            raw.parse()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", key, raw, e))
        }
    }
}

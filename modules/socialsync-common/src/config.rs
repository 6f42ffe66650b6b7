use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;

/// Engine configuration. Endpoint and secret come from the environment;
/// tunables default to the documented constants and may be overridden by
/// a TOML file named in `SOCIALSYNC_CONFIG`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Backend
    pub api_url: String,
    pub api_token: Option<String>,
    pub timeouts: TimeoutConfig,

    // Calendar
    pub timezone: Tz,
    pub pre_season_end: NaiveTime,
    pub episode_start: NaiveTime,
    pub post_season_days: u32,

    // Polling
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub transient_budget: u32,
    pub poll_backoff: Vec<Duration>,

    // Convergence
    pub max_passes: u32,
    pub max_duration: Duration,
    pub prefetch_concurrency: usize,
}

/// Per-call deadlines for the backend API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub create_run: Duration,
    pub run_status: Duration,
    pub cache: Duration,
    pub coverage: Duration,
    pub metadata: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_run: Duration::from_secs(15),
            run_status: Duration::from_secs(15),
            cache: Duration::from_secs(35),
            coverage: Duration::from_secs(35),
            metadata: Duration::from_secs(12),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api/v1".to_string(),
            api_token: None,
            timeouts: TimeoutConfig::default(),
            timezone: chrono_tz::America::New_York,
            pre_season_end: NaiveTime::from_hms_opt(19, 0, 0).unwrap_or(NaiveTime::MIN),
            episode_start: NaiveTime::from_hms_opt(19, 1, 1).unwrap_or(NaiveTime::MIN),
            post_season_days: 7,
            poll_interval: Duration::from_secs(3),
            poll_attempts: 80,
            transient_budget: 5,
            poll_backoff: vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(10),
                Duration::from_secs(15),
            ],
            max_passes: 8,
            max_duration: Duration::from_secs(90 * 60),
            prefetch_concurrency: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log_redacted();
        Ok(config)
    }

    /// Build from an arbitrary variable source. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_url = lookup("SOCIALSYNC_API_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("SOCIALSYNC_API_URL environment variable is required"))?;

        let mut config = Self {
            api_url,
            api_token: lookup("SOCIALSYNC_API_TOKEN").filter(|v| !v.is_empty()),
            ..Self::default()
        };

        if let Some(tz) = lookup("SOCIALSYNC_TIMEZONE").filter(|v| !v.trim().is_empty()) {
            config.timezone = parse_timezone(&tz)?;
        }

        if let Some(path) = lookup("SOCIALSYNC_CONFIG").filter(|v| !v.trim().is_empty()) {
            let overrides = load_overrides(Path::new(&path))?;
            config = config.apply(overrides)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Layer file overrides on top of this config. Unset fields keep their value.
    pub fn apply(mut self, file: ConfigOverrides) -> Result<Self> {
        if let Some(tz) = file.timezone {
            self.timezone = parse_timezone(&tz)?;
        }
        if let Some(t) = file.pre_season_end {
            self.pre_season_end = parse_time("pre_season_end", &t)?;
        }
        if let Some(t) = file.episode_start {
            self.episode_start = parse_time("episode_start", &t)?;
        }
        if let Some(days) = file.post_season_days {
            self.post_season_days = days;
        }
        if let Some(secs) = file.poll_interval_secs {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = file.poll_attempts {
            self.poll_attempts = n;
        }
        if let Some(n) = file.transient_budget {
            self.transient_budget = n;
        }
        if let Some(schedule) = file.poll_backoff_secs {
            self.poll_backoff = schedule.into_iter().map(Duration::from_secs).collect();
        }
        if let Some(n) = file.max_passes {
            self.max_passes = n;
        }
        if let Some(mins) = file.max_duration_mins {
            self.max_duration = Duration::from_secs(mins * 60);
        }
        if let Some(n) = file.prefetch_concurrency {
            self.prefetch_concurrency = n;
        }
        if let Some(t) = file.timeouts {
            let secs = Duration::from_secs;
            if let Some(v) = t.create_run_secs {
                self.timeouts.create_run = secs(v);
            }
            if let Some(v) = t.run_status_secs {
                self.timeouts.run_status = secs(v);
            }
            if let Some(v) = t.cache_secs {
                self.timeouts.cache = secs(v);
            }
            if let Some(v) = t.coverage_secs {
                self.timeouts.coverage = secs(v);
            }
            if let Some(v) = t.metadata_secs {
                self.timeouts.metadata = secs(v);
            }
        }
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(anyhow!("max_passes must be at least 1"));
        }
        if self.poll_attempts == 0 {
            return Err(anyhow!("poll_attempts must be at least 1"));
        }
        if self.prefetch_concurrency == 0 {
            return Err(anyhow!("prefetch_concurrency must be at least 1"));
        }
        if self.poll_backoff.is_empty() {
            return Err(anyhow!("poll_backoff_secs must not be empty"));
        }
        if self.episode_start < self.pre_season_end {
            return Err(anyhow!(
                "episode_start ({}) must not precede pre_season_end ({})",
                self.episode_start,
                self.pre_season_end
            ));
        }
        Ok(())
    }

    /// Log loaded values with the token reduced to a short preview.
    pub fn log_redacted(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => {
                    let n = v.chars().take(5).map(char::len_utf8).sum::<usize>();
                    format!("{}...({} chars)", &v[..n], v.len())
                }
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  SOCIALSYNC_API_URL: {}", self.api_url);
        tracing::info!("  SOCIALSYNC_API_TOKEN: {}", preview_opt(&self.api_token));
        tracing::info!("  SOCIALSYNC_TIMEZONE: {}", self.timezone);
        tracing::info!(
            max_passes = self.max_passes,
            max_duration_mins = self.max_duration.as_secs() / 60,
            poll_interval_secs = self.poll_interval.as_secs(),
            poll_attempts = self.poll_attempts,
            transient_budget = self.transient_budget,
            "  Convergence limits"
        );
    }
}

/// TOML override file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub timezone: Option<String>,
    pub pre_season_end: Option<String>,
    pub episode_start: Option<String>,
    pub post_season_days: Option<u32>,
    pub poll_interval_secs: Option<u64>,
    pub poll_attempts: Option<u32>,
    pub transient_budget: Option<u32>,
    pub poll_backoff_secs: Option<Vec<u64>>,
    pub max_passes: Option<u32>,
    pub max_duration_mins: Option<u64>,
    pub prefetch_concurrency: Option<usize>,
    pub timeouts: Option<TimeoutOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutOverrides {
    pub create_run_secs: Option<u64>,
    pub run_status_secs: Option<u64>,
    pub cache_secs: Option<u64>,
    pub coverage_secs: Option<u64>,
    pub metadata_secs: Option<u64>,
}

/// Load and parse a TOML override file.
pub fn load_overrides(path: &Path) -> Result<ConfigOverrides> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let overrides: ConfigOverrides = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(overrides)
}

fn parse_timezone(value: &str) -> Result<Tz> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|e| anyhow!("invalid timezone {value:?}: {e}"))
}

fn parse_time(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value.trim(), "%H:%M"))
        .with_context(|| format!("{field} must be HH:MM[:SS], got {value:?}"))
}

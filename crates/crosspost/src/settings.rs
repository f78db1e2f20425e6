//! TOML configuration for the `crosspost` binary.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable [`Settings`] for the read-only commands. Commands that run the
//! pipeline call [`Settings::validate`] first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crosspost_analytics::{AnalyticsConfig, DEFAULT_RUN_HISTORY, DEFAULT_SMOOTHING_K};
use crosspost_pipeline::{
    ApprovalConfig, CaptionConfig, EditingOptions, FilterConfig, PipelineConfig, RetryPolicy,
    SearchFilters,
};
use crosspost_scheduler::{SchedulerConfig, parse_time_of_day, parse_timezone};

/// File name looked up under the user config directory.
pub const CONFIG_FILE_NAME: &str = "crosspost.toml";

/// Errors loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub content: ContentSettings,
    pub filter: FilterConfig,
    pub editing: EditingSettings,
    pub caption: CaptionConfig,
    pub schedule: ScheduleSettings,
    pub pipeline: PipelineSettings,
    pub analytics: AnalyticsSettings,
    pub services: ServiceSettings,
    pub storage: StorageSettings,
}

/// What to look for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSettings {
    pub category: String,
    pub keywords: Vec<String>,
    pub max_candidates: u32,
    /// Search window understood by the discovery service, e.g. `this_week`.
    pub timeframe: String,
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            category: String::new(),
            keywords: Vec::new(),
            max_candidates: 50,
            timeframe: "this_week".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditingSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub watermark: Option<String>,
    pub burn_subtitles: bool,
    pub intro_outro: bool,
}

impl Default for EditingSettings {
    fn default() -> Self {
        let options = EditingOptions::default();
        Self {
            width: options.width,
            height: options.height,
            fps: options.fps,
            watermark: options.watermark,
            burn_subtitles: options.burn_subtitles,
            intro_outro: options.intro_outro,
        }
    }
}

impl From<&EditingSettings> for EditingOptions {
    fn from(s: &EditingSettings) -> Self {
        EditingOptions {
            width: s.width,
            height: s.height,
            fps: s.fps,
            watermark: s.watermark.clone(),
            burn_subtitles: s.burn_subtitles,
            intro_outro: s.intro_outro,
        }
    }
}

/// Posting cadence preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Once a day at each configured post time.
    #[default]
    Daily,
    /// Morning and evening, regardless of the configured post times.
    TwiceDaily,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub timezone: String,
    pub post_times: Vec<String>,
    pub frequency: Frequency,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: "UTC".to_string(),
            post_times: vec!["19:00".to_string()],
            frequency: Frequency::Daily,
        }
    }
}

impl ScheduleSettings {
    /// Local times the daemon posts at.
    pub fn effective_times(&self) -> Vec<String> {
        match self.frequency {
            Frequency::Daily => self.post_times.clone(),
            Frequency::TwiceDaily => vec!["09:00".to_string(), "19:00".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub dry_run: bool,
    pub require_approval: bool,
    pub approval_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub download_retry: RetryPolicy,
    /// Pause before the single transform retry.
    pub transform_retry_delay_ms: u64,
    pub publish_retry: RetryPolicy,
    pub cleanup_artifacts: bool,
    /// How long a stopping daemon waits for in-flight runs.
    pub grace_period_secs: u64,
    /// Longest the scheduler sleeps between checks.
    pub poll_interval_secs: u64,
    /// How often the daemon looks for approval decisions.
    pub approval_poll_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let base = PipelineConfig::default();
        Self {
            dry_run: base.dry_run,
            require_approval: base.approval.enabled,
            approval_timeout_secs: base.approval.timeout_secs,
            run_timeout_secs: base.run_timeout_secs,
            call_timeout_secs: base.call_timeout_secs,
            download_retry: base.download_retry,
            transform_retry_delay_ms: base.transform_retry_delay_ms,
            publish_retry: base.publish_retry,
            cleanup_artifacts: base.cleanup_artifacts,
            grace_period_secs: 30,
            poll_interval_secs: 60,
            approval_poll_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub enabled: bool,
    pub smoothing_k: f64,
    pub reporting_timezone: String,
    pub min_ranked_records: usize,
    pub refresh_interval_secs: u64,
    /// How many of the most recent posts each refresh covers.
    pub refresh_limit: usize,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            smoothing_k: DEFAULT_SMOOTHING_K,
            reporting_timezone: "UTC".to_string(),
            min_ranked_records: 0,
            refresh_interval_secs: 60 * 60,
            refresh_limit: 10,
        }
    }
}

/// Where the collaborator services live.
///
/// Each collaborator falls back to `base_url` when its own URL is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub base_url: String,
    pub discovery_url: Option<String>,
    pub downloader_url: Option<String>,
    pub transformer_url: Option<String>,
    pub captioner_url: Option<String>,
    pub publisher_url: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_string(),
            discovery_url: None,
            downloader_url: None,
            transformer_url: None,
            captioner_url: None,
            publisher_url: None,
            connect_timeout_secs: 10,
        }
    }
}

impl ServiceSettings {
    fn pick<'a>(&'a self, specific: &'a Option<String>) -> &'a str {
        specific.as_deref().unwrap_or(&self.base_url)
    }

    pub fn discovery(&self) -> &str {
        self.pick(&self.discovery_url)
    }

    pub fn downloader(&self) -> &str {
        self.pick(&self.downloader_url)
    }

    pub fn transformer(&self) -> &str {
        self.pick(&self.transformer_url)
    }

    pub fn captioner(&self) -> &str {
        self.pick(&self.captioner_url)
    }

    pub fn publisher(&self) -> &str {
        self.pick(&self.publisher_url)
    }
}

/// On-disk locations. Relative paths resolve against `data_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: Option<PathBuf>,
    pub metrics: PathBuf,
    pub schedules: PathBuf,
    pub approvals: PathBuf,
    /// Most recent run records kept in the metrics store.
    pub run_history: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            metrics: PathBuf::from("metrics.json"),
            schedules: PathBuf::from("schedules.json"),
            approvals: PathBuf::from("approvals"),
            run_history: DEFAULT_RUN_HISTORY,
        }
    }
}

impl StorageSettings {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("crosspost")
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.resolve(&self.metrics)
    }

    pub fn schedules_path(&self) -> PathBuf {
        self.resolve(&self.schedules)
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.resolve(&self.approvals)
    }
}

/// Default config location: `<config dir>/crosspost/crosspost.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("crosspost").join(CONFIG_FILE_NAME))
}

impl Settings {
    /// Load settings from `path`, or from the default location.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => {
                    tracing::debug!("no config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Check everything the pipeline and daemon depend on.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.content.category.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "content.category must be set".into(),
            ));
        }
        if self.content.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(SettingsError::Invalid(
                "content.keywords must list at least one keyword".into(),
            ));
        }

        parse_timezone(&self.schedule.timezone)
            .map_err(|e| SettingsError::Invalid(format!("schedule.timezone: {e}")))?;
        for time in &self.schedule.effective_times() {
            parse_time_of_day(time)
                .map_err(|e| SettingsError::Invalid(format!("schedule.post_times: {e}")))?;
        }
        if self.schedule.enabled && self.schedule.effective_times().is_empty() {
            return Err(SettingsError::Invalid(
                "schedule.post_times must not be empty while the schedule is enabled".into(),
            ));
        }

        self.analytics_config()?;
        if self.analytics.refresh_interval_secs == 0 {
            return Err(SettingsError::Invalid(
                "analytics.refresh_interval_secs must be positive".into(),
            ));
        }
        if self.pipeline.approval_poll_secs == 0 {
            return Err(SettingsError::Invalid(
                "pipeline.approval_poll_secs must be positive".into(),
            ));
        }

        self.pipeline_config(false)
            .validate()
            .map_err(|e| SettingsError::Invalid(e.to_string()))
    }

    /// The immutable configuration handed to each run.
    pub fn pipeline_config(&self, force_dry_run: bool) -> PipelineConfig {
        PipelineConfig {
            category: self.content.category.trim().to_string(),
            keywords: self.content.keywords.clone(),
            search: SearchFilters {
                max_results: self.content.max_candidates,
                timeframe: self.content.timeframe.clone(),
                min_views: self.filter.min_views,
            },
            filter: self.filter.clone(),
            editing: EditingOptions::from(&self.editing),
            caption: self.caption.clone(),
            approval: ApprovalConfig {
                enabled: self.pipeline.require_approval,
                timeout_secs: self.pipeline.approval_timeout_secs,
            },
            dry_run: force_dry_run || self.pipeline.dry_run,
            run_timeout_secs: self.pipeline.run_timeout_secs,
            call_timeout_secs: self.pipeline.call_timeout_secs,
            download_retry: self.pipeline.download_retry.clone(),
            transform_retry_delay_ms: self.pipeline.transform_retry_delay_ms,
            publish_retry: self.pipeline.publish_retry.clone(),
            cleanup_artifacts: self.pipeline.cleanup_artifacts,
        }
    }

    pub fn analytics_config(&self) -> Result<AnalyticsConfig, SettingsError> {
        if !self.analytics.smoothing_k.is_finite() || self.analytics.smoothing_k < 0.0 {
            return Err(SettingsError::Invalid(
                "analytics.smoothing_k must be a non-negative number".into(),
            ));
        }
        let reporting_timezone = parse_timezone(&self.analytics.reporting_timezone)
            .map_err(|e| SettingsError::Invalid(format!("analytics.reporting_timezone: {e}")))?;
        Ok(AnalyticsConfig {
            smoothing_k: self.analytics.smoothing_k,
            reporting_timezone,
            min_ranked_records: self.analytics.min_ranked_records,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.pipeline.poll_interval_secs.max(1)),
            grace_period: Duration::from_secs(self.pipeline.grace_period_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r##"
[content]
category = "motivational"
keywords = ["motivation", "mindset"]

[filter]
min_views = 5000

[editing]
burn_subtitles = true

[caption]
style = "casual"
custom_hashtags = ["#daily"]

[schedule]
timezone = "America/New_York"
post_times = ["08:30", "18:00"]

[pipeline]
dry_run = true
require_approval = true
approval_timeout_secs = 3600
transform_retry_delay_ms = 250

[pipeline.publish_retry]
max_attempts = 5

[analytics]
smoothing_k = 5.0
reporting_timezone = "Europe/Berlin"

[services]
base_url = "http://services.local"
publisher_url = "http://publisher.local"

[storage]
data_dir = "/var/lib/crosspost"
run_history = 200
"##;

    fn valid() -> Settings {
        let mut settings = Settings::default();
        settings.content.category = "tech".into();
        settings.content.keywords = vec!["rust".into()];
        settings
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.schedule.effective_times(), vec!["19:00"]);
        assert_eq!(settings.analytics.refresh_limit, 10);
    }

    #[test]
    fn test_sample_file_parses() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.content.category, "motivational");
        assert_eq!(settings.filter.min_views, 5000);
        assert!(settings.editing.burn_subtitles);
        assert_eq!(settings.schedule.effective_times(), vec!["08:30", "18:00"]);
        assert_eq!(settings.pipeline.publish_retry.max_attempts, 5);
        // Unset fields of a partially specified table keep their defaults.
        assert_eq!(
            settings.pipeline.publish_retry.base_delay_ms,
            RetryPolicy::default().base_delay_ms
        );
        assert_eq!(settings.storage.run_history, 200);
        assert_eq!(settings.services.discovery(), "http://services.local");
        assert_eq!(settings.services.publisher(), "http://publisher.local");
        assert_eq!(
            settings.storage.metrics_path(),
            PathBuf::from("/var/lib/crosspost/metrics.json")
        );
    }

    #[test]
    fn test_pipeline_config_carries_sections() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        let config = settings.pipeline_config(false);

        assert_eq!(config.category, "motivational");
        assert_eq!(config.search.min_views, 5000);
        assert_eq!(config.search.max_results, 50);
        assert!(config.editing.burn_subtitles);
        assert!(config.approval.enabled);
        assert_eq!(config.approval.timeout_secs, 3600);
        assert!(config.dry_run);
        assert_eq!(config.transform_retry().max_attempts, 2);
        assert_eq!(config.transform_retry().base_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_dry_run_flag_forces_dry_run() {
        let settings = valid();
        assert!(!settings.pipeline_config(false).dry_run);
        assert!(settings.pipeline_config(true).dry_run);
    }

    #[test]
    fn test_twice_daily_ignores_post_times() {
        let mut settings = valid();
        settings.schedule.frequency = Frequency::TwiceDaily;
        settings.schedule.post_times = vec!["03:00".into()];
        assert_eq!(settings.schedule.effective_times(), vec!["09:00", "19:00"]);
    }

    #[test]
    fn test_validate_rejects_missing_category() {
        let mut settings = valid();
        settings.content.category = "  ".into();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid(msg)) if msg.contains("category")
        ));
    }

    #[test]
    fn test_validate_rejects_empty_keywords() {
        let mut settings = valid();
        settings.content.keywords.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_time_and_timezone() {
        let mut settings = valid();
        settings.schedule.post_times = vec!["25:00".into()];
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.schedule.timezone = "Mars/Olympus".into();
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.analytics.reporting_timezone = "Nowhere".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_analytics_config_rejects_negative_k() {
        let mut settings = valid();
        settings.analytics.smoothing_k = -1.0;
        assert!(settings.analytics_config().is_err());
    }

    #[test]
    fn test_unknown_enum_value_is_a_parse_error() {
        let err = toml::from_str::<Settings>("[schedule]\nfrequency = \"hourly\"\n").unwrap_err();
        assert!(err.to_string().contains("hourly"));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Settings::load(Some(&missing)),
            Err(SettingsError::Io { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, SAMPLE).unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.content.keywords, vec!["motivation", "mindset"]);
    }
}

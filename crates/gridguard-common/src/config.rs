//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveTime, Weekday};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Consumer group tag that matches every consumer during negotiation.
pub const ALL_CONSUMER_GROUPS: &str = "all";

fn default_guard_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_debounce() -> Duration {
    Duration::from_secs(1)
}

fn default_minimum_change_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_minimum_peak_load() -> f64 {
    2500.0
}

fn default_history_capacity() -> usize {
    200
}

fn default_demand_interval_minutes() -> u32 {
    15
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("target/state")
}

fn default_true() -> bool {
    true
}

fn default_simulation_seed() -> u64 {
    0xA11CEu64
}

fn default_base_load() -> f64 {
    450.0
}

fn default_solar_peak() -> f64 {
    6000.0
}

fn default_noise_sigma() -> f64 {
    60.0
}

fn default_load_time_frames() -> Vec<LoadTimeFrame> {
    vec![LoadTimeFrame::Now, LoadTimeFrame::LastMinute]
}

fn default_minimum_current() -> f64 {
    6.0
}

fn default_maximum_current() -> f64 {
    16.0
}

fn default_rebalancing_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_voltage() -> f64 {
    230.0
}

/// Primary configuration object for the gridguard runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub battery: Option<BatteryConfig>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub consumers: IndexMap<String, ConsumerConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "GRIDGUARD_CONFIG";

    /// Load configuration from disk, respecting the `GRIDGUARD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Retrieve a consumer configuration by name.
    pub fn consumer(&self, name: &str) -> Option<&ConsumerConfig> {
        self.consumers.get(name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.grid.validate()?;
        for (name, consumer) in &self.consumers {
            consumer.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the guard tick.
    #[serde(default = "default_guard_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub guard_interval: Duration,
    /// Quiet period before a burst of triggers runs one cycle. Zero runs synchronously.
    #[serde(default = "default_debounce")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub debounce: Duration,
    /// Cooldown after a cycle that started or stopped a consumer.
    #[serde(default = "default_minimum_change_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub minimum_change_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            guard_interval: default_guard_interval(),
            debounce: default_debounce(),
            minimum_change_interval: default_minimum_change_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.guard_interval.is_zero() {
            return Err(anyhow!("scheduler.guard_interval must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Lower bound applied to the peak threshold reported upstream.
    #[serde(default = "default_minimum_peak_load")]
    pub minimum_peak_load: f64,
    /// Samples retained per metric.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Length of the utility's demand billing interval.
    #[serde(default = "default_demand_interval_minutes")]
    pub demand_interval_minutes: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            minimum_peak_load: default_minimum_peak_load(),
            history_capacity: default_history_capacity(),
            demand_interval_minutes: default_demand_interval_minutes(),
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(anyhow!("grid.history_capacity must be at least 1"));
        }
        if self.demand_interval_minutes == 0 || 60 % self.demand_interval_minutes != 0 {
            return Err(anyhow!(
                "grid.demand_interval_minutes must divide an hour, got {}",
                self.demand_interval_minutes
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub capacity_wh: f64,
    pub max_charge_power: f64,
    pub max_discharge_power: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_state_directory")]
    pub directory: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_state_directory(),
        }
    }
}

/// Parameters of the simulated household used by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_seed")]
    pub seed: u64,
    #[serde(default = "default_base_load")]
    pub base_load: f64,
    #[serde(default = "default_solar_peak")]
    pub solar_peak: f64,
    #[serde(default = "default_noise_sigma")]
    pub noise_sigma: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: default_simulation_seed(),
            base_load: default_base_load(),
            solar_peak: default_solar_peak(),
            noise_sigma: default_noise_sigma(),
        }
    }
}

/// Load estimate used when judging a start or stop.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoadTimeFrame {
    Now,
    #[serde(rename = "last_30_seconds")]
    Last30Seconds,
    LastMinute,
    #[serde(rename = "last_2_minutes")]
    Last2Minutes,
    #[serde(rename = "last_5_minutes")]
    Last5Minutes,
    SolarForecastNow,
    #[serde(rename = "solar_forecast_30_minutes")]
    SolarForecast30Minutes,
}

impl LoadTimeFrame {
    /// Trailing window for averaged frames.
    pub fn window(&self) -> Option<Duration> {
        match self {
            LoadTimeFrame::Last30Seconds => Some(Duration::from_secs(30)),
            LoadTimeFrame::LastMinute => Some(Duration::from_secs(60)),
            LoadTimeFrame::Last2Minutes => Some(Duration::from_secs(120)),
            LoadTimeFrame::Last5Minutes => Some(Duration::from_secs(300)),
            LoadTimeFrame::Now
            | LoadTimeFrame::SolarForecastNow
            | LoadTimeFrame::SolarForecast30Minutes => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingMethod {
    #[default]
    SolarOnly,
    SolarSurplus,
    MidPoint,
    SolarPreferred,
    MidPeak,
    NearPeak,
    MaximizeQuarterPeak,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllowBatteryPower {
    #[default]
    Yes,
    No,
    MaxPower,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    #[default]
    Fixed,
    Dynamic,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub kind: ConsumerKind,
    #[serde(default)]
    pub groups: Vec<String>,
    pub switch_on_load: f64,
    pub switch_off_load: f64,
    pub peak_load: f64,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub minimum_runtime: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub maximum_runtime: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub minimum_timeout: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub maximum_timeout: Option<Duration>,
    #[serde(default)]
    pub time_windows: Vec<TimeWindowConfig>,
    #[serde(default = "default_load_time_frames")]
    pub load_time_frames_on_start: Vec<LoadTimeFrame>,
    #[serde(default = "default_load_time_frames")]
    pub load_time_frames_on_stop: Vec<LoadTimeFrame>,
    /// Required when `kind` is `dynamic`.
    #[serde(default)]
    pub dynamic: Option<DynamicConfig>,
}

impl ConsumerConfig {
    /// Minimal fixed consumer, mostly useful for tests.
    pub fn fixed(switch_on_load: f64, switch_off_load: f64, peak_load: f64) -> Self {
        Self {
            kind: ConsumerKind::Fixed,
            groups: Vec::new(),
            switch_on_load,
            switch_off_load,
            peak_load,
            minimum_runtime: None,
            maximum_runtime: None,
            minimum_timeout: None,
            maximum_timeout: None,
            time_windows: Vec::new(),
            load_time_frames_on_start: default_load_time_frames(),
            load_time_frames_on_stop: default_load_time_frames(),
            dynamic: None,
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.switch_off_load <= self.switch_on_load {
            return Err(anyhow!(
                "consumer '{}': switch_off_load ({}) must be above switch_on_load ({})",
                name,
                self.switch_off_load,
                self.switch_on_load
            ));
        }
        if self.peak_load < 0.0 {
            return Err(anyhow!("consumer '{}': peak_load must not be negative", name));
        }
        if self.load_time_frames_on_start.is_empty() || self.load_time_frames_on_stop.is_empty() {
            return Err(anyhow!(
                "consumer '{}': load time frame lists must not be empty",
                name
            ));
        }
        if let (Some(min), Some(max)) = (self.minimum_runtime, self.maximum_runtime) {
            if min > max {
                return Err(anyhow!(
                    "consumer '{}': minimum_runtime exceeds maximum_runtime",
                    name
                ));
            }
        }
        match (self.kind, &self.dynamic) {
            (ConsumerKind::Dynamic, None) => Err(anyhow!(
                "consumer '{}': kind = \"dynamic\" requires a [consumers.{}.dynamic] section",
                name,
                name
            )),
            (ConsumerKind::Dynamic, Some(dynamic)) => dynamic.validate(name),
            (ConsumerKind::Fixed, _) => Ok(()),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub balancing_method: BalancingMethod,
    #[serde(default = "default_minimum_current")]
    pub minimum_current: f64,
    #[serde(default = "default_maximum_current")]
    pub maximum_current: f64,
    #[serde(default = "default_rebalancing_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub minimum_rebalancing_interval: Duration,
    /// Group whose admissions may count on this consumer's slack.
    #[serde(default)]
    pub balance_on_behalf_of: Option<String>,
    #[serde(default)]
    pub allow_battery_power: AllowBatteryPower,
    #[serde(default = "default_voltage")]
    pub voltage: f64,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            balancing_method: BalancingMethod::default(),
            minimum_current: default_minimum_current(),
            maximum_current: default_maximum_current(),
            minimum_rebalancing_interval: default_rebalancing_interval(),
            balance_on_behalf_of: None,
            allow_battery_power: AllowBatteryPower::default(),
            voltage: default_voltage(),
        }
    }
}

impl DynamicConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.minimum_current < 0.0 || self.minimum_current > self.maximum_current {
            return Err(anyhow!(
                "consumer '{}': current bounds [{}, {}] are invalid",
                name,
                self.minimum_current,
                self.maximum_current
            ));
        }
        if self.voltage <= 0.0 {
            return Err(anyhow!("consumer '{}': voltage must be positive", name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeWindowConfig {
    /// Active weekdays; empty means every day.
    #[serde(default)]
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Name of a binary condition that must be on for the window to count.
    #[serde(default)]
    pub condition: Option<String>,
}

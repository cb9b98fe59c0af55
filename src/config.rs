//! TOML-based shedder, reactor, and rule configuration.

use std::fs;
use std::path::Path;

use chrono::NaiveTime;
use serde::Deserialize;
use thiserror::Error;

use crate::shedder::rules::ShedRule;

/// Top-level configuration parsed from TOML.
///
/// All fields have defaults matching the documented baseline. Load from TOML
/// with [`ShedderConfig::from_toml_file`] or use `ShedderConfig::default()`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShedderConfig {
    /// Decision-loop parameters.
    pub shedder: ShedSettings,
    /// Instruction reactor parameters.
    pub reactor: ReactorSettings,
    /// Per-control shed rules.
    pub rules: Vec<RuleConfig>,
}

/// Decision-loop parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShedSettings {
    /// Average power above which shedding is required (W).
    pub shed_threshold_watts: i32,
    /// Whole-rule-set cool-down between actions (seconds).
    pub limit_execution_monitor_secs: u32,
    /// Trailing window for the power average (seconds).
    pub power_average_sample_secs: u32,
    /// Maximum retained power samples.
    pub sample_buffer_limit: usize,
}

impl Default for ShedSettings {
    fn default() -> Self {
        Self {
            shed_threshold_watts: 9500,
            limit_execution_monitor_secs: 60,
            power_average_sample_secs: 10,
            sample_buffer_limit: 10,
        }
    }
}

/// Instruction reactor parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReactorSettings {
    /// Hours an instruction may remain unhandled before it is declined.
    pub execution_received_hour_limit: u32,
    /// Hours after which handled, acknowledged instructions are purged.
    pub purge_completed_hours: u32,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            execution_received_hour_limit: 24,
            purge_completed_hours: 72,
        }
    }
}

/// One shed rule as written in configuration.
///
/// Time windows use 24-hour `"H:mm"` strings; [`RuleConfig::to_rule`] parses
/// them into a [`ShedRule`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub control_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Ascending order of consideration; unset sorts last.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub time_window_start: Option<String>,
    #[serde(default)]
    pub time_window_end: Option<String>,
    /// Hold period after a shed before the control may be released (minutes).
    #[serde(default)]
    pub minimum_limit_minutes: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"rules[0].time_window_start"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

fn parse_time_of_day(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|e| format!("expected 24-hour \"H:mm\" time, got \"{value}\": {e}"))
}

impl RuleConfig {
    /// Parses the rule into its evaluated form.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for an empty control id or an unparseable
    /// time window bound. `field` is relative to the rule (no index prefix).
    pub fn to_rule(&self) -> Result<ShedRule, ConfigError> {
        if self.control_id.trim().is_empty() {
            return Err(ConfigError {
                field: "control_id".into(),
                message: "must not be empty".into(),
            });
        }
        let time_window_start = self
            .time_window_start
            .as_deref()
            .map(parse_time_of_day)
            .transpose()
            .map_err(|message| ConfigError {
                field: "time_window_start".into(),
                message,
            })?;
        let time_window_end = self
            .time_window_end
            .as_deref()
            .map(parse_time_of_day)
            .transpose()
            .map_err(|message| ConfigError {
                field: "time_window_end".into(),
                message,
            })?;
        Ok(ShedRule {
            control_id: self.control_id.clone(),
            name: self.name.clone(),
            priority: self.priority,
            active: self.active,
            time_window_start,
            time_window_end,
            minimum_limit_minutes: self.minimum_limit_minutes,
        })
    }
}

impl ShedderConfig {
    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if the configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let s = &self.shedder;

        if s.shed_threshold_watts <= 0 {
            errors.push(ConfigError {
                field: "shedder.shed_threshold_watts".into(),
                message: "must be > 0".into(),
            });
        }
        if s.power_average_sample_secs == 0 {
            errors.push(ConfigError {
                field: "shedder.power_average_sample_secs".into(),
                message: "must be > 0".into(),
            });
        }
        if s.sample_buffer_limit == 0 {
            errors.push(ConfigError {
                field: "shedder.sample_buffer_limit".into(),
                message: "must be > 0".into(),
            });
        }
        if self.reactor.execution_received_hour_limit == 0 {
            errors.push(ConfigError {
                field: "reactor.execution_received_hour_limit".into(),
                message: "must be > 0".into(),
            });
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if let Err(e) = rule.to_rule() {
                errors.push(ConfigError {
                    field: format!("rules[{index}].{}", e.field),
                    message: e.message,
                });
            }
        }

        errors
    }

    /// Parses every rule entry, failing on the first invalid one.
    ///
    /// # Errors
    ///
    /// Returns the first rule's `ConfigError` with an indexed field path.
    pub fn rules(&self) -> Result<Vec<ShedRule>, ConfigError> {
        self.rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                rule.to_rule().map_err(|e| ConfigError {
                    field: format!("rules[{index}].{}", e.field),
                    message: e.message,
                })
            })
            .collect()
    }
}

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Environment prefix; nested keys are split on `__`.
pub const ENV_PREFIX: &str = "ZEROENERGY__";
/// Names an extra TOML file merged on top of `config/default.toml`.
pub const CONFIG_PATH_VAR: &str = "ZEROENERGY_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
    #[error("invalid configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub dispatch: DispatchConfig,
    #[validate(nested)]
    pub meter: MeterConfig,
    #[validate(nested)]
    pub mqtt: MqttConfig,
    pub log: LogConfig,
}

/// Bounds and timing of the dispatch loop. Discharge is positive, charge negative.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchConfig {
    #[validate(range(max = 0.0))]
    pub max_charge_w: f64,
    #[validate(range(min = 0.0))]
    pub max_discharge_w: f64,
    #[validate(range(min = 0.0))]
    pub high_consumption_threshold_w: f64,
    #[validate(range(min = 0.0))]
    pub hysteresis_buffer_w: f64,
    #[validate(range(min = 1))]
    pub update_cycle_seconds: u64,
    #[validate(range(min = 1))]
    pub samples_per_cycle: u32,
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc_full_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc_empty_percent: f64,
    pub telemetry_wait_seconds: u64,
    pub warmup_seconds: u64,
    /// Log commands instead of publishing them.
    pub simulate: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_charge_w: -100.0,
            max_discharge_w: 100.0,
            high_consumption_threshold_w: 1000.0,
            hysteresis_buffer_w: 10.0,
            update_cycle_seconds: 30,
            samples_per_cycle: 5,
            soc_full_percent: 99.9,
            soc_empty_percent: 10.0,
            telemetry_wait_seconds: 30,
            warmup_seconds: 5,
            simulate: false,
        }
    }
}

impl DispatchConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.update_cycle_seconds)
    }

    pub fn telemetry_wait(&self) -> Duration {
        Duration::from_secs(self.telemetry_wait_seconds)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MeterKind {
    #[default]
    Tasmota,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MeterConfig {
    pub kind: MeterKind,
    #[validate(url)]
    pub base_url: String,
    /// Dotted path of the power field inside the status document.
    #[validate(length(min = 1))]
    pub json_path: String,
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            kind: MeterKind::Tasmota,
            base_url: String::new(),
            json_path: "StatusSNS.Energy.Power_cur".to_string(),
            timeout_seconds: 5,
        }
    }
}

impl MeterConfig {
    pub fn path_segments(&self) -> Vec<String> {
        self.json_path.trim().split('.').map(str::to_string).collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MqttConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(range(min = 5))]
    pub keep_alive_seconds: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    #[validate(length(min = 1))]
    pub command_topic: String,
    #[validate(length(min = 1))]
    pub telemetry_topic: String,
    #[validate(length(min = 1))]
    pub soc_field: String,
    #[validate(length(min = 1))]
    pub grid_power_field: String,
    #[validate(range(min = 1))]
    pub ack_timeout_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "zeroenergy".to_string(),
            keep_alive_seconds: 60,
            username: None,
            password: None,
            command_topic: "homeassistant/number/MSA-280024370560/power_ctrl/set".to_string(),
            telemetry_topic: "homeassistant/sensor/MSA-280024370560/quick/state".to_string(),
            soc_field: "sys_soc".to_string(),
            grid_power_field: "sys_grid_power".to_string(),
            ack_timeout_seconds: 10,
        }
    }
}

impl MqttConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Raises the default filter to `debug`. `RUST_LOG` still wins.
    pub debug: bool,
    pub json: bool,
    /// Optional log file, written in addition to stdout.
    pub file: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"));
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Field-level rules from the derive, then the cross-field ones.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let d = &self.dispatch;
        let numbers = [
            ("dispatch.max_charge_w", d.max_charge_w),
            ("dispatch.max_discharge_w", d.max_discharge_w),
            ("dispatch.high_consumption_threshold_w", d.high_consumption_threshold_w),
            ("dispatch.hysteresis_buffer_w", d.hysteresis_buffer_w),
            ("dispatch.soc_full_percent", d.soc_full_percent),
            ("dispatch.soc_empty_percent", d.soc_empty_percent),
        ];
        // Range rules do not reject NaN.
        if let Some((name, _)) = numbers.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Inconsistent(format!("{name} must be a finite number")));
        }
        if d.soc_empty_percent >= d.soc_full_percent {
            return Err(ConfigError::Inconsistent(format!(
                "dispatch.soc_empty_percent ({}) must be below dispatch.soc_full_percent ({})",
                d.soc_empty_percent, d.soc_full_percent
            )));
        }
        if self.meter.path_segments().iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::Inconsistent(format!(
                "meter.json_path '{}' contains an empty segment",
                self.meter.json_path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn figment_with(toml: &str) -> Figment {
        Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml))
    }

    #[test]
    fn test_defaults_need_meter_url() {
        let err = Config::from_figment(figment_with("")).unwrap_err();
        match err.downcast_ref::<ConfigError>() {
            Some(ConfigError::Invalid(errors)) => {
                assert!(errors.errors().keys().any(|k| k.to_string() == "meter"), "{errors}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_load_overrides() {
        let cfg = Config::from_figment(figment_with(
            r#"
            [dispatch]
            max_discharge_w = 400.0
            samples_per_cycle = 3

            [meter]
            base_url = "http://192.168.178.50"
            json_path = "StatusSNS.ENERGY.Power"
            "#,
        ))
        .unwrap();

        assert_eq!(cfg.dispatch.max_discharge_w, 400.0);
        assert_eq!(cfg.dispatch.max_charge_w, -100.0);
        assert_eq!(cfg.dispatch.samples_per_cycle, 3);
        assert_eq!(cfg.dispatch.cycle(), Duration::from_secs(30));
        assert_eq!(cfg.meter.kind, MeterKind::Tasmota);
        assert_eq!(cfg.meter.path_segments(), vec!["StatusSNS", "ENERGY", "Power"]);
        assert_eq!(cfg.mqtt.port, 1883);
    }

    #[test]
    fn test_rejects_positive_charge_bound() {
        let result = Config::from_figment(figment_with(
            r#"
            [dispatch]
            max_charge_w = 50.0
            [meter]
            base_url = "http://meter"
            "#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_samples() {
        let result = Config::from_figment(figment_with(
            r#"
            [dispatch]
            samples_per_cycle = 0
            [meter]
            base_url = "http://meter"
            "#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_inverted_soc_guards() {
        let result = Config::from_figment(figment_with(
            r#"
            [dispatch]
            soc_full_percent = 20.0
            soc_empty_percent = 30.0
            [meter]
            base_url = "http://meter"
            "#,
        ));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("soc_empty_percent"), "{err}");
    }

    #[test]
    fn test_rejects_negative_consumption_threshold() {
        let result = Config::from_figment(figment_with(
            r#"
            [dispatch]
            high_consumption_threshold_w = -1.0
            [meter]
            base_url = "http://meter"
            "#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_nan_bounds() {
        for field in ["max_charge_w", "max_discharge_w", "hysteresis_buffer_w"] {
            let err = Config::from_figment(figment_with(&format!(
                "[dispatch]\n{field} = nan\n[meter]\nbase_url = \"http://meter\"\n"
            )))
            .unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn test_rejects_empty_path_segment() {
        let result = Config::from_figment(figment_with(
            r#"
            [meter]
            base_url = "http://meter"
            json_path = "StatusSNS..Power"
            "#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_meter_kind_fails() {
        let result = Config::from_figment(figment_with(
            r#"
            [meter]
            kind = "shelly"
            base_url = "http://meter"
            "#,
        ));
        assert!(result.is_err());
    }
}

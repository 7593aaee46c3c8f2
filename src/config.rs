//! Which checks are on.
//!
//! A [`Config`] is built once, validated, and then frozen inside the checker.
//! It can be assembled in code with [`Config::builder`] or read from the
//! environment with [`Config::from_env`]:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `MEMWARD_SAFE_MEMORY_MANAGEMENT` | `safe_memory_management` | `false` |
//! | `MEMWARD_SAFE_MEMORY_ACCESS` | `safe_memory_access` | `false` |
//! | `MEMWARD_CONCURRENT_ACCESS_CHECK` | `concurrent_access_check` | `false` |
//! | `MEMWARD_CUSTOM_MEMORY_MANAGEMENT` | `custom_memory_management` | `false` |
//! | `MEMWARD_CALLER_INFO_MONITORING` | `caller_info_monitoring` | `false` |
//! | `MEMWARD_MAX_CALLER_INFO_DEPTH` | `max_caller_info_depth` | `4` |
//! | `MEMWARD_THREAD_PARTITIONED_STORAGE` | `thread_partitioned_storage` | `false` |
//!
//! Booleans accept `true`/`false`/`1`/`0`/`yes`/`no`/`on`/`off`.

use std::env;

use serde::{Deserialize, Serialize};

use crate::{
    caller::DEFAULT_MAX_DEPTH,
    error::ConfigError,
    ledger::{DEFAULT_INITIAL_CAPACITY, DEFAULT_LOAD_FACTOR, MAX_INITIAL_CAPACITY},
};

pub const ENV_PREFIX: &str = "MEMWARD_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Validate free/reallocate targets against the ledger
    pub safe_memory_management: bool,
    /// Validate access targets against the ledger. Cannot be combined with
    /// `custom_memory_management`.
    pub safe_memory_access: bool,
    /// Arbitrate accesses against frees with the [`crate::guard::AccessGuard`]
    pub concurrent_access_check: bool,
    /// Operations come from user-registered call sites (see
    /// [`crate::callsite`]) rather than the canonical primitives
    pub custom_memory_management: bool,
    pub caller_info_monitoring: bool,
    pub max_caller_info_depth: usize,
    /// One ledger per thread
    pub thread_partitioned_storage: bool,
    pub ledger_initial_capacity: usize,
    pub ledger_load_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            safe_memory_management: false,
            safe_memory_access: false,
            concurrent_access_check: false,
            custom_memory_management: false,
            caller_info_monitoring: false,
            max_caller_info_depth: DEFAULT_MAX_DEPTH,
            thread_partitioned_storage: false,
            ledger_initial_capacity: DEFAULT_INITIAL_CAPACITY,
            ledger_load_factor: DEFAULT_LOAD_FACTOR,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safe_memory_access && self.custom_memory_management {
            return Err(ConfigError::ExclusiveModes);
        }
        if self.max_caller_info_depth == 0 {
            return Err(ConfigError::ZeroCallerDepth);
        }
        if !(self.ledger_load_factor > 0.0 && self.ledger_load_factor < 1.0) {
            return Err(ConfigError::InvalidLoadFactor(self.ledger_load_factor));
        }
        if self.ledger_initial_capacity > MAX_INITIAL_CAPACITY {
            return Err(ConfigError::InitialCapacityTooLarge(self.ledger_initial_capacity));
        }
        Ok(())
    }

    /// Read the process environment on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`Config::from_env`], but `lookup` stands in for the environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(&format!("{ENV_PREFIX}{name}")).map(|v| (name, v));
        let mut builder = Self::builder();
        if let Some((key, value)) = get("SAFE_MEMORY_MANAGEMENT") {
            builder = builder.safe_memory_management(parse_bool(key, &value)?);
        }
        if let Some((key, value)) = get("SAFE_MEMORY_ACCESS") {
            builder = builder.safe_memory_access(parse_bool(key, &value)?);
        }
        if let Some((key, value)) = get("CONCURRENT_ACCESS_CHECK") {
            builder = builder.concurrent_access_check(parse_bool(key, &value)?);
        }
        if let Some((key, value)) = get("CUSTOM_MEMORY_MANAGEMENT") {
            builder = builder.custom_memory_management(parse_bool(key, &value)?);
        }
        if let Some((key, value)) = get("CALLER_INFO_MONITORING") {
            builder = builder.caller_info_monitoring(parse_bool(key, &value)?);
        }
        if let Some((key, value)) = get("MAX_CALLER_INFO_DEPTH") {
            let depth = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key,
                value: value.clone(),
            })?;
            builder = builder.max_caller_info_depth(depth);
        }
        if let Some((key, value)) = get("THREAD_PARTITIONED_STORAGE") {
            builder = builder.thread_partitioned_storage(parse_bool(key, &value)?);
        }
        builder.build()
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
        }),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn safe_memory_management(mut self, enabled: bool) -> Self {
        self.config.safe_memory_management = enabled;
        self
    }

    pub fn safe_memory_access(mut self, enabled: bool) -> Self {
        self.config.safe_memory_access = enabled;
        self
    }

    pub fn concurrent_access_check(mut self, enabled: bool) -> Self {
        self.config.concurrent_access_check = enabled;
        self
    }

    pub fn custom_memory_management(mut self, enabled: bool) -> Self {
        self.config.custom_memory_management = enabled;
        self
    }

    pub fn caller_info_monitoring(mut self, enabled: bool) -> Self {
        self.config.caller_info_monitoring = enabled;
        self
    }

    pub fn max_caller_info_depth(mut self, depth: usize) -> Self {
        self.config.max_caller_info_depth = depth;
        self
    }

    pub fn thread_partitioned_storage(mut self, enabled: bool) -> Self {
        self.config.thread_partitioned_storage = enabled;
        self
    }

    pub fn ledger_initial_capacity(mut self, capacity: usize) -> Self {
        self.config.ledger_initial_capacity = capacity;
        self
    }

    pub fn ledger_load_factor(mut self, load_factor: f64) -> Self {
        self.config.ledger_load_factor = load_factor;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_all_off() {
        let config = Config::default();
        assert!(!config.safe_memory_management);
        assert!(!config.safe_memory_access);
        assert!(!config.concurrent_access_check);
        assert!(!config.custom_memory_management);
        assert!(!config.caller_info_monitoring);
        assert!(!config.thread_partitioned_storage);
        assert_eq!(config.max_caller_info_depth, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn access_and_custom_management_are_exclusive() {
        let err = Config::builder()
            .safe_memory_access(true)
            .custom_memory_management(true)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ExclusiveModes);
    }

    #[test]
    fn rejects_bad_depth_and_load_factor() {
        assert_eq!(
            Config::builder().max_caller_info_depth(0).build().unwrap_err(),
            ConfigError::ZeroCallerDepth
        );
        assert_eq!(
            Config::builder().ledger_load_factor(1.0).build().unwrap_err(),
            ConfigError::InvalidLoadFactor(1.0)
        );
    }

    #[test]
    fn rejects_oversized_initial_capacity() {
        assert_eq!(
            Config::builder()
                .ledger_initial_capacity(usize::MAX)
                .build()
                .unwrap_err(),
            ConfigError::InitialCapacityTooLarge(usize::MAX)
        );
        let partitioned = Config {
            thread_partitioned_storage: true,
            ledger_initial_capacity: MAX_INITIAL_CAPACITY + 1,
            ..Config::default()
        };
        assert!(matches!(
            partitioned.validate(),
            Err(ConfigError::InitialCapacityTooLarge(_))
        ));
        assert!(Config::builder()
            .ledger_initial_capacity(MAX_INITIAL_CAPACITY)
            .build()
            .is_ok());
    }

    #[test]
    fn reads_environment() {
        let config = Config::from_lookup(lookup(&[
            ("MEMWARD_SAFE_MEMORY_MANAGEMENT", "true"),
            ("MEMWARD_CONCURRENT_ACCESS_CHECK", "1"),
            ("MEMWARD_MAX_CALLER_INFO_DEPTH", " 8 "),
            ("MEMWARD_THREAD_PARTITIONED_STORAGE", "off"),
        ]))
        .unwrap();
        assert!(config.safe_memory_management);
        assert!(config.concurrent_access_check);
        assert!(!config.thread_partitioned_storage);
        assert_eq!(config.max_caller_info_depth, 8);
    }

    #[test]
    fn environment_errors_name_the_key() {
        let err = Config::from_lookup(lookup(&[("MEMWARD_SAFE_MEMORY_ACCESS", "maybe")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "SAFE_MEMORY_ACCESS",
                value: "maybe".to_owned()
            }
        );
        let err = Config::from_lookup(lookup(&[
            ("MEMWARD_SAFE_MEMORY_ACCESS", "yes"),
            ("MEMWARD_CUSTOM_MEMORY_MANAGEMENT", "yes"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::ExclusiveModes);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{ "safe_memory_access": true }"#).unwrap();
        assert!(config.safe_memory_access);
        assert_eq!(config.ledger_initial_capacity, 16);
    }
}

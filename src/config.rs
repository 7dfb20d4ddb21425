//! Configuration types.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name of the root zone.
    pub root_zone_name: String,
    /// Treat a second `load_patch` with the same name as an error.
    pub force_duplicate_zone_check: bool,
    /// Patches that `load_patch` silently skips.
    pub disabled_patches: HashSet<String>,
    /// Upper bound on snapshot passes in a single microtask drain (0 = unlimited).
    pub max_drain_passes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_zone_name: "<root>".to_string(),
            force_duplicate_zone_check: false,
            disabled_patches: HashSet::new(),
            max_drain_passes: 0,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from `ZONE_RT_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("ZONE_RT_ROOT_NAME") {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "ZONE_RT_ROOT_NAME".to_string(),
                    message: "root zone name must not be empty".to_string(),
                });
            }
            config.root_zone_name = name;
        }

        if let Some(raw) = lookup("ZONE_RT_FORCE_DUPLICATE_CHECK") {
            config.force_duplicate_zone_check = parse_bool("ZONE_RT_FORCE_DUPLICATE_CHECK", &raw)?;
        }

        if let Some(raw) = lookup("ZONE_RT_DISABLE_PATCHES") {
            config.disabled_patches = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(raw) = lookup("ZONE_RT_MAX_DRAIN_PASSES") {
            config.max_drain_passes =
                raw.trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        key: "ZONE_RT_MAX_DRAIN_PASSES".to_string(),
                        message: e.to_string(),
                    })?;
        }

        Ok(config)
    }

    /// Whether `load_patch` should skip the named patch.
    pub fn is_patch_disabled(&self, name: &str) -> bool {
        self.disabled_patches.contains(name)
    }
}

/// Host event loop configuration.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Smallest delay a timer can be scheduled with.
    pub min_timer_delay: Duration,
    /// Maximum macrotask turns `run_until_idle` performs before giving up.
    pub max_idle_turns: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            min_timer_delay: Duration::ZERO,
            max_idle_turns: 10_000,
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = RuntimeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.root_zone_name, "<root>");
        assert!(!config.force_duplicate_zone_check);
        assert!(config.disabled_patches.is_empty());
        assert_eq!(config.max_drain_passes, 0);
    }

    #[test]
    fn reads_all_keys() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("ZONE_RT_ROOT_NAME", "app-root"),
            ("ZONE_RT_FORCE_DUPLICATE_CHECK", "true"),
            ("ZONE_RT_DISABLE_PATCHES", "timers, events,,"),
            ("ZONE_RT_MAX_DRAIN_PASSES", "64"),
        ]))
        .unwrap();
        assert_eq!(config.root_zone_name, "app-root");
        assert!(config.force_duplicate_zone_check);
        assert!(config.is_patch_disabled("timers"));
        assert!(config.is_patch_disabled("events"));
        assert_eq!(config.disabled_patches.len(), 2);
        assert_eq!(config.max_drain_passes, 64);
    }

    #[test]
    fn rejects_bad_bool() {
        let err = RuntimeConfig::from_lookup(lookup(&[("ZONE_RT_FORCE_DUPLICATE_CHECK", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("ZONE_RT_FORCE_DUPLICATE_CHECK"));
    }

    #[test]
    fn rejects_empty_root_name() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("ZONE_RT_ROOT_NAME", "  ")])).is_err());
    }

    #[test]
    fn rejects_non_numeric_drain_passes() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("ZONE_RT_MAX_DRAIN_PASSES", "lots")])).is_err());
    }
}

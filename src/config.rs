use crate::engine::Isa;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use std::env;

/// Disables the accelerated path when set to `0` or `false`.
pub const ACCELERATED_VAR: &str = "OXIDNN_ACCELERATED";
/// Selects the [`Isa`], one of `reference`, `simd8` or `simd16`.
pub const ISA_VAR: &str = "OXIDNN_ISA";
/// Bounds every primitive cache, evicting in insertion order.
pub const CACHE_CAPACITY_VAR: &str = "OXIDNN_CACHE_CAPACITY";

static CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("invalid oxidnn environment, using defaults: {e:#}");
        Config::default()
    })
});

/// Runtime configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Whether operators with a reference fallback may use the accelerated path.
    pub accelerated: bool,
    /// Implementation candidates available to the engine.
    pub isa: Isa,
    /// Capacity of each primitive cache, unbounded when `None`.
    pub cache_capacity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accelerated: true,
            isa: Isa::Simd16,
            cache_capacity: None,
        }
    }
}

impl Config {
    /// Reads the config from the environment.
    ///
    /// Unset variables keep their defaults.
    ///
    /// **Errors**
    /// - A variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = var(ACCELERATED_VAR) {
            config.accelerated = !matches!(value.trim(), "0" | "false" | "False" | "FALSE");
        }
        if let Some(value) = var(ISA_VAR) {
            config.isa = value.trim().parse()?;
        }
        if let Some(value) = var(CACHE_CAPACITY_VAR) {
            let capacity = value
                .trim()
                .parse()
                .with_context(|| format!("{CACHE_CAPACITY_VAR}={value:?}"))?;
            config.cache_capacity.replace(capacity);
        }
        Ok(config)
    }
    /// The process wide config, read from the environment once.
    pub fn global() -> &'static Config {
        &CONFIG
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        assert_eq!(from_map(&[]).unwrap(), Config::default());
    }

    #[test]
    fn parse_vars() {
        let config = from_map(&[
            (ACCELERATED_VAR, "0"),
            (ISA_VAR, "simd8"),
            (CACHE_CAPACITY_VAR, "4"),
        ])
        .unwrap();
        assert!(!config.accelerated);
        assert_eq!(config.isa, Isa::Simd8);
        assert_eq!(config.cache_capacity, Some(4));
    }

    #[test]
    fn parse_invalid() {
        assert!(from_map(&[(ISA_VAR, "avx9000")]).is_err());
        assert!(from_map(&[(CACHE_CAPACITY_VAR, "many")]).is_err());
    }
}

use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::str::FromStr;

pub const BATCH_WRITER_MAX_MEMORY: &str = "batch_writer.max_memory";
pub const SCANNER_BATCH_SIZE: &str = "scanner.batch_size";

pub const DEFAULT_BATCH_WRITER_MAX_MEMORY: u64 = 100_000;
pub const DEFAULT_SCANNER_BATCH_SIZE: usize = 1_000;

/// Scalar settings consulted by a [`Session`](crate::Session).
///
/// Values are plain strings keyed by dotted names. Explicitly set properties
/// shadow the defaults. Settings are read when a resource is created, so a
/// change only affects writers and scanners opened afterwards.
#[derive(Debug)]
pub struct Config {
    properties: RwLock<BTreeMap<String, String>>,
    defaults: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut defaults = BTreeMap::new();
        defaults.insert(
            BATCH_WRITER_MAX_MEMORY.to_string(),
            DEFAULT_BATCH_WRITER_MAX_MEMORY.to_string(),
        );
        defaults.insert(
            SCANNER_BATCH_SIZE.to_string(),
            DEFAULT_SCANNER_BATCH_SIZE.to_string(),
        );
        Self {
            properties: RwLock::new(BTreeMap::new()),
            defaults,
        }
    }
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            properties: RwLock::new(self.properties.read().clone()),
            defaults: self.defaults.clone(),
        }
    }
}

impl Config {
    /// Small buffers and scan batches so tests exercise threshold flushes and
    /// multi-batch scans with a handful of cells.
    pub fn development() -> Self {
        Self::default()
            .with(BATCH_WRITER_MAX_MEMORY, "1024")
            .with(SCANNER_BATCH_SIZE, "4")
    }

    pub fn from_map(properties: BTreeMap<String, String>) -> Self {
        let config = Self::default();
        *config.properties.write() = properties;
        config
    }

    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.write().insert(key.into(), value.into());
    }

    pub fn unset(&self, key: &str) -> Option<String> {
        self.properties.write().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.properties
            .read()
            .get(key)
            .or_else(|| self.defaults.get(key))
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.properties.read().contains_key(key) || self.defaults.contains_key(key)
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| StoreError::InvalidConfig {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            })
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get_parsed(key)
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get_parsed(key)
    }

    /// Max bytes a batch writer buffers before the backend flushes it.
    pub fn batch_writer_max_memory(&self) -> Result<u64> {
        let value = self
            .get_u64(BATCH_WRITER_MAX_MEMORY)?
            .unwrap_or(DEFAULT_BATCH_WRITER_MAX_MEMORY);
        if value == 0 {
            return Err(StoreError::InvalidConfig {
                key: BATCH_WRITER_MAX_MEMORY.to_string(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    pub fn scanner_batch_size(&self) -> Result<usize> {
        let value = self
            .get_parsed::<usize>(SCANNER_BATCH_SIZE)?
            .unwrap_or(DEFAULT_SCANNER_BATCH_SIZE);
        if value == 0 {
            return Err(StoreError::InvalidConfig {
                key: SCANNER_BATCH_SIZE.to_string(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    /// Effective settings: defaults overlaid with explicit properties.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut out = self.defaults.clone();
        out.extend(
            self.properties
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorCode;

    #[test]
    fn defaults_apply_when_key_absent() {
        let config = Config::default();
        assert_eq!(
            config.batch_writer_max_memory().expect("max memory"),
            DEFAULT_BATCH_WRITER_MAX_MEMORY
        );
        assert_eq!(
            config.get(BATCH_WRITER_MAX_MEMORY).as_deref(),
            Some("100000")
        );
        assert!(config.get("no.such.key").is_none());
    }

    #[test]
    fn explicit_property_shadows_default() {
        let config = Config::default().with(BATCH_WRITER_MAX_MEMORY, "2048");
        assert_eq!(config.batch_writer_max_memory().expect("max memory"), 2048);

        config.unset(BATCH_WRITER_MAX_MEMORY);
        assert_eq!(
            config.batch_writer_max_memory().expect("max memory"),
            DEFAULT_BATCH_WRITER_MAX_MEMORY
        );
    }

    #[test]
    fn malformed_values_are_reported_with_key() {
        let config = Config::default().with(BATCH_WRITER_MAX_MEMORY, "lots");
        let err = config.batch_writer_max_memory().expect_err("not a number");
        assert_eq!(err.code(), StoreErrorCode::InvalidConfig);
        assert!(err.to_string().contains(BATCH_WRITER_MAX_MEMORY));

        let zero = Config::default().with(SCANNER_BATCH_SIZE, "0");
        assert!(zero.scanner_batch_size().is_err());
    }

    #[test]
    fn typed_getters_parse_trimmed_values() {
        let config = Config::default()
            .with("feature.enabled", " true ")
            .with("limit", "42");
        assert_eq!(config.get_bool("feature.enabled").expect("bool"), Some(true));
        assert_eq!(config.get_u64("limit").expect("u64"), Some(42));
        assert_eq!(config.get_u64("absent").expect("absent"), None);
    }

    #[test]
    fn to_map_overlays_properties_on_defaults() {
        let config = Config::development().with("extra", "1");
        let map = config.to_map();
        assert_eq!(map.get(BATCH_WRITER_MAX_MEMORY).map(String::as_str), Some("1024"));
        assert_eq!(map.get(SCANNER_BATCH_SIZE).map(String::as_str), Some("4"));
        assert_eq!(map.get("extra").map(String::as_str), Some("1"));
        assert!(config.contains("extra"));
    }

    #[test]
    fn from_map_loads_properties_over_defaults() {
        let mut properties = BTreeMap::new();
        properties.insert(SCANNER_BATCH_SIZE.to_string(), "25".to_string());
        let config = Config::from_map(properties);
        assert_eq!(config.scanner_batch_size().expect("size"), 25);
        assert_eq!(
            config.batch_writer_max_memory().expect("max memory"),
            DEFAULT_BATCH_WRITER_MAX_MEMORY
        );
    }

    #[test]
    fn clone_is_independent() {
        let original = Config::default();
        let copy = original.clone();
        copy.set(SCANNER_BATCH_SIZE, "7");
        assert_eq!(original.scanner_batch_size().expect("size"), 1_000);
        assert_eq!(copy.scanner_batch_size().expect("size"), 7);
    }
}

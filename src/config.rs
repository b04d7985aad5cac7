//! Configuration as a key lookup service.
//!
//! Keys are lower snake case (`disabled_instrumentations`). Sources are
//! layered with [`CompositeSource`]; the first source that has a key wins.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const INSTRUMENT: &str = "instrument";
pub const DISABLED_INSTRUMENTATIONS: &str = "disabled_instrumentations";
pub const LOG_LEVEL: &str = "log_level";

/// Environment variable prefix for [`EnvironmentSource`].
pub const ENV_PREFIX: &str = "ELASTIC_APM_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid boolean {value:?} for {key}")]
    InvalidBool { key: String, value: String },
    #[error("option {0:?} has no key")]
    EmptyKey(String),
}

pub trait ConfigurationSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn name(&self) -> &str;
}

#[derive(Debug, Default, Clone)]
pub struct MapSource {
    name: String,
    values: HashMap<String, String>,
}

impl MapSource {
    pub fn new(name: impl Into<String>) -> Self {
        MapSource { name: name.into(), values: HashMap::new() }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigurationSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The `-agentpath:lib.so=<options>` string.
///
/// Options are `key=value` pairs separated by commas. A token without `=`
/// continues the previous value, so
/// `disabled_instrumentations=jdbc,redis,instrument=false` disables two
/// groups.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    values: Vec<(String, String)>,
}

impl AgentOptions {
    pub fn parse(options: &str) -> Result<Self, ConfigError> {
        let mut values: Vec<(String, String)> = Vec::new();
        for token in options.split(',') {
            match token.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(ConfigError::EmptyKey(token.to_string()));
                    }
                    values.push((key.to_string(), value.trim().to_string()));
                }
                None => match values.last_mut() {
                    Some((_, value)) => {
                        value.push(',');
                        value.push_str(token.trim());
                    }
                    None if token.trim().is_empty() => {}
                    None => return Err(ConfigError::EmptyKey(token.to_string())),
                },
            }
        }
        Ok(AgentOptions { values })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigurationSource for AgentOptions {
    fn get(&self, key: &str) -> Option<String> {
        // last occurrence wins
        self.values.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    fn name(&self) -> &str {
        "agent options"
    }
}

/// Reads `ELASTIC_APM_<KEY>` from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvironmentSource;

impl ConfigurationSource for EnvironmentSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())).ok()
    }

    fn name(&self) -> &str {
        "environment"
    }
}

#[derive(Default, Clone)]
pub struct CompositeSource {
    sources: Vec<Arc<dyn ConfigurationSource>>,
}

impl CompositeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn ConfigurationSource>) -> Self {
        self.sources.push(source);
        self
    }
}

impl ConfigurationSource for CompositeSource {
    fn get(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.get(key))
    }

    fn name(&self) -> &str {
        "composite"
    }
}

/// The settings the engine itself reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfiguration {
    instrument: bool,
    disabled_instrumentations: BTreeSet<String>,
    log_level: String,
}

impl Default for CoreConfiguration {
    fn default() -> Self {
        CoreConfiguration {
            instrument: true,
            disabled_instrumentations: BTreeSet::new(),
            log_level: "info".to_string(),
        }
    }
}

impl CoreConfiguration {
    pub fn from_source(source: &dyn ConfigurationSource) -> Result<Self, ConfigError> {
        let mut config = CoreConfiguration::default();
        if let Some(value) = source.get(INSTRUMENT) {
            config.instrument = parse_bool(INSTRUMENT, &value)?;
        }
        if let Some(value) = source.get(DISABLED_INSTRUMENTATIONS) {
            config.disabled_instrumentations = parse_list(&value);
        }
        if let Some(value) = source.get(LOG_LEVEL) {
            let value = value.trim();
            if !value.is_empty() {
                config.log_level = value.to_string();
            }
        }
        Ok(config)
    }

    pub fn with_instrument(mut self, instrument: bool) -> Self {
        self.instrument = instrument;
        self
    }

    pub fn with_disabled_instrumentation(mut self, group: impl Into<String>) -> Self {
        self.disabled_instrumentations.insert(group.into());
        self
    }

    /// Global instrumentation switch.
    pub fn is_instrument(&self) -> bool {
        self.instrument
    }

    /// Groups switched off by name.
    pub fn disabled_instrumentations(&self) -> &BTreeSet<String> {
        &self.disabled_instrumentations
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool { key: key.to_string(), value: value.to_string() }),
    }
}

fn parse_list(value: &str) -> BTreeSet<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_continue_list_values() {
        let opts = AgentOptions::parse("disabled_instrumentations=jdbc, redis,instrument=false").unwrap();
        assert_eq!(opts.get(DISABLED_INSTRUMENTATIONS).as_deref(), Some("jdbc,redis"));
        assert_eq!(opts.get(INSTRUMENT).as_deref(), Some("false"));
        assert_eq!(opts.get("missing"), None);
    }

    #[test]
    fn options_reject_leading_values() {
        assert!(AgentOptions::parse("").unwrap().is_empty());
        assert_eq!(AgentOptions::parse("jdbc"), Err(ConfigError::EmptyKey("jdbc".into())));
        assert!(AgentOptions::parse("=x").is_err());
    }

    #[test]
    fn core_configuration_defaults() {
        let config = CoreConfiguration::from_source(&MapSource::new("empty")).unwrap();
        assert!(config.is_instrument());
        assert!(config.disabled_instrumentations().is_empty());
        assert_eq!(config.log_level(), "info");
    }

    #[test]
    fn core_configuration_reads_keys() {
        let source = MapSource::new("test")
            .with(INSTRUMENT, "No")
            .with(DISABLED_INSTRUMENTATIONS, " logging , ,jul-ecs")
            .with(LOG_LEVEL, "debug");
        let config = CoreConfiguration::from_source(&source).unwrap();
        assert!(!config.is_instrument());
        let groups: Vec<&str> = config.disabled_instrumentations().iter().map(String::as_str).collect();
        assert_eq!(groups, ["jul-ecs", "logging"]);
        assert_eq!(config.log_level(), "debug");
    }

    #[test]
    fn malformed_booleans_are_errors() {
        let source = MapSource::new("test").with(INSTRUMENT, "maybe");
        assert_eq!(
            CoreConfiguration::from_source(&source),
            Err(ConfigError::InvalidBool { key: INSTRUMENT.into(), value: "maybe".into() })
        );
    }

    #[test]
    fn composite_takes_first_hit() {
        let composite = CompositeSource::new()
            .with(Arc::new(MapSource::new("a").with(LOG_LEVEL, "trace")))
            .with(Arc::new(MapSource::new("b").with(LOG_LEVEL, "warn").with(INSTRUMENT, "false")));
        assert_eq!(composite.get(LOG_LEVEL).as_deref(), Some("trace"));
        assert_eq!(composite.get(INSTRUMENT).as_deref(), Some("false"));
    }
}

//! The handle instrumentation modules receive in `init`.

use std::fmt;
use std::sync::Arc;

use crate::config::{ConfigError, ConfigurationSource, CoreConfiguration, EnvironmentSource};

/// Resolved core settings plus the raw source they came from, so modules
/// can look up their own keys.
#[derive(Clone)]
pub struct Tracer {
    core: CoreConfiguration,
    source: Arc<dyn ConfigurationSource>,
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    pub fn core(&self) -> &CoreConfiguration {
        &self.core
    }

    pub fn config(&self, key: &str) -> Option<String> {
        self.source.get(key)
    }

    pub fn source(&self) -> &Arc<dyn ConfigurationSource> {
        &self.source
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("core", &self.core)
            .field("source", &self.source.name())
            .finish()
    }
}

#[derive(Default)]
pub struct TracerBuilder {
    source: Option<Arc<dyn ConfigurationSource>>,
}

impl TracerBuilder {
    pub fn with_source(mut self, source: Arc<dyn ConfigurationSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Reads configuration from the given source, or the environment.
    pub fn build(self) -> Result<Tracer, ConfigError> {
        let source = self.source.unwrap_or_else(|| Arc::new(EnvironmentSource));
        let core = CoreConfiguration::from_source(source.as_ref())?;
        Ok(Tracer { core, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapSource;

    #[test]
    fn exposes_raw_keys_next_to_core_settings() {
        let source = MapSource::new("test").with("instrument", "false").with("ecs_service_name", "shop");
        let tracer = Tracer::builder().with_source(Arc::new(source)).build().unwrap();
        assert!(!tracer.core().is_instrument());
        assert_eq!(tracer.config("ecs_service_name").as_deref(), Some("shop"));
    }
}

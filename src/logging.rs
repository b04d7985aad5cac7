//! Log output for a native agent.
//!
//! The engine only emits `tracing` events; a subscriber is installed here
//! by the native entry points. Embedders with their own subscriber simply
//! never call [`init`].

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable holding a filter directive, e.g. `apm_bci=trace`.
pub const LOG_ENV: &str = "APM_LOG";

pub const DEFAULT_LEVEL: &str = "info";

/// Installs a stderr subscriber. The filter comes from [`LOG_ENV`], then
/// `level`, then [`DEFAULT_LEVEL`].
///
/// Returns `false` if a global subscriber already exists.
pub fn init(level: Option<&str>) -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter(std::env::var(LOG_ENV).ok().as_deref(), level))
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

fn filter(env: Option<&str>, level: Option<&str>) -> EnvFilter {
    [env, level]
        .into_iter()
        .flatten()
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LEVEL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_through_sources() {
        assert_eq!(filter(Some("debug"), Some("warn")).to_string(), "debug");
        assert_eq!(filter(None, Some("warn")).to_string(), "warn");
        assert_eq!(filter(Some("apm_bci=loud"), Some("trace")).to_string(), "trace");
        assert_eq!(filter(None, None).to_string(), "info");
    }
}

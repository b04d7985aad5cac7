//! Which instrumentation modules get activated.

use crate::config::CoreConfiguration;
use crate::instrumentation::Instrumentation;

/// A module is excluded if any of its groups is disabled. Otherwise it is
/// included when instrumentation is globally on, or when it asks to run
/// regardless.
pub fn is_included(instrumentation: &dyn Instrumentation, config: &CoreConfiguration) -> bool {
    let disabled = config.disabled_instrumentations();
    if instrumentation.group_names().iter().any(|g| disabled.contains(g)) {
        return false;
    }
    instrumentation.include_when_instrumentation_is_disabled() || config.is_instrument()
}

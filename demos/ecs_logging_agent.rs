//! ECS logging correlation agent.
//!
//! Calls a hook from `co.elastic.logging.jul.EcsFormatter#getMdcEntries` so
//! every copy of the formatter, the application's and any bundled one,
//! picks up correlation ids. The hook class ships in the agent jar.
//!
//! # Building
//!
//! ```bash
//! cargo build --release --example ecs_logging_agent
//! ```
//!
//! # Running
//!
//! ```bash
//! java -agentpath:./target/release/examples/libecs_logging_agent.so=agent_jar=/opt/apm/hooks.jar MyApp
//! ```
//!
//! Switch it off with `disabled_instrumentations=jul-ecs`, or everything
//! logging related with `disabled_instrumentations=logging`.

use std::sync::Arc;

use apm_bci::matcher::class_loader_with_name;
use apm_bci::prelude::*;
use tracing::debug;

/// Loader the agent uses for its own plugin classes.
const PLUGIN_CLASS_LOADER: &str = "co.elastic.apm.agent.bci.classloading.IndyPluginClassLoader";

struct JulEcsFormatterInstrumentation {
    hook: HookReference,
}

impl Instrumentation for JulEcsFormatterInstrumentation {
    fn type_matcher(&self) -> Junction<TypeDescription> {
        named("co.elastic.logging.jul.EcsFormatter")
    }

    fn method_matcher(&self) -> Junction<MethodDescription> {
        named("getMdcEntries")
    }

    // The formatter copy inside the agent must stay untouched.
    fn class_loader_matcher(&self) -> Junction<ClassLoaderDescription> {
        not(is_bootstrap_class_loader()).and(not(class_loader_with_name(PLUGIN_CLASS_LOADER)))
    }

    fn group_names(&self) -> Vec<String> {
        vec!["logging".to_string(), "jul-ecs".to_string()]
    }

    fn hook(&self) -> HookReference {
        self.hook.clone()
    }

    fn init(&self, tracer: &Tracer) -> Result<(), BoxError> {
        debug!(service_name = ?tracer.config("service_name"), "jul-ecs correlation enabled");
        Ok(())
    }

    fn name(&self) -> &str {
        "JulEcsFormatterInstrumentation"
    }
}

fn catalog(ctx: &AgentContext) -> Vec<Arc<dyn Instrumentation>> {
    vec![Arc::new(JulEcsFormatterInstrumentation {
        hook: ctx.hook("co.elastic.apm.agent.ecs_logging.JulEcsFormatterAdvice"),
    })]
}

export_agent!(catalog);

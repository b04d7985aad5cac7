//! What the exported `Agent_OnLoad`, `Agent_OnAttach` and `Agent_OnUnload`
//! entry points do. See [`export_agent!`](crate::export_agent).
//!
//! Retransformation is not allowed while the JVM is still in the OnLoad
//! phase, so a launch-time agent only registers itself there and
//! initializes from `VMInit`. An attached agent initializes right away.
//! Either way the classes are restored from `VMDeath`, the last event that
//! still runs in the live phase; `Agent_OnUnload` only forgets the state.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentError, ApmAgent};
use crate::config::{AgentOptions, CompositeSource, ConfigurationSource, EnvironmentSource, LOG_LEVEL};
use crate::host::InstrumentationHost;
use crate::instrumentation::{HookReference, Instrumentation};
use crate::jvmti_host::{JvmtiHost, VmLifecycle};
use crate::locator::{ClassFileLocator, InMemoryLocator, LocatorError};
use crate::logging;
use crate::sys::{jni, jvmti};
use crate::tracer::Tracer;

/// Option naming the agent jar, e.g. `agent_jar=/opt/apm/agent.jar`.
pub const AGENT_JAR: &str = "agent_jar";

/// Builds the instrumentation catalog once the agent knows where its hook
/// classes live.
pub type DescriptorFactory = fn(&AgentContext) -> Vec<Arc<dyn Instrumentation>>;

pub struct AgentContext {
    agent_jar: Option<PathBuf>,
    hook_locator: Arc<dyn ClassFileLocator>,
}

impl AgentContext {
    pub fn new(agent_jar: Option<PathBuf>, hook_locator: Arc<dyn ClassFileLocator>) -> Self {
        AgentContext { agent_jar, hook_locator }
    }

    pub fn agent_jar(&self) -> Option<&Path> {
        self.agent_jar.as_deref()
    }

    /// Reads hook classes out of the agent jar.
    pub fn hook_locator(&self) -> Arc<dyn ClassFileLocator> {
        Arc::clone(&self.hook_locator)
    }

    /// A hook in the agent jar, by binary name.
    pub fn hook(&self, class_name: &str) -> HookReference {
        HookReference::new(class_name, self.hook_locator())
    }
}

struct Pending {
    options: AgentOptions,
    factory: DescriptorFactory,
}

static PENDING: Mutex<Option<Pending>> = parking_lot::const_mutex(None);

/// # Safety
///
/// `vm` and `options` are the arguments the JVM passed to `Agent_OnLoad`.
pub unsafe fn on_load(vm: *mut jni::JavaVM, options: *const c_char, factory: DescriptorFactory) -> jni::jint {
    let Some(options) = startup_options(options) else {
        return jni::JNI_ERR;
    };
    let lifecycle = VmLifecycle { vm_init: Some(vm_init), vm_death: Some(vm_death) };
    let host = match JvmtiHost::install(vm, lifecycle) {
        Ok(host) => host,
        Err(e) => {
            error!(error = %e, "cannot set up JVMTI");
            return jni::JNI_ERR;
        }
    };
    for (event, label) in [(jvmti::JVMTI_EVENT_VM_INIT, "VMInit"), (jvmti::JVMTI_EVENT_VM_DEATH, "VMDeath")] {
        if let Err(e) = host.jvmti().set_event_notification_mode(true, event) {
            error!(error = %host.jvmti().describe_error(e), "cannot enable {}", label);
            return jni::JNI_ERR;
        }
    }
    *PENDING.lock() = Some(Pending { options, factory });
    jni::JNI_OK
}

unsafe extern "system" fn vm_init(_jvmti_env: *mut jvmti::jvmtiEnv, _jni_env: *mut jni::JNIEnv, _thread: jni::jthread) {
    let Some(pending) = PENDING.lock().take() else {
        return;
    };
    let Some(host) = JvmtiHost::get() else {
        return;
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| start(host, &pending.options, pending.factory)));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "cannot initialize instrumentation"),
        Err(_) => error!("initialization panicked"),
    }
}

/// # Safety
///
/// `vm` and `options` are the arguments the JVM passed to `Agent_OnAttach`.
pub unsafe fn on_attach(vm: *mut jni::JavaVM, options: *const c_char, factory: DescriptorFactory) -> jni::jint {
    let Some(options) = startup_options(options) else {
        return jni::JNI_ERR;
    };
    let lifecycle = VmLifecycle { vm_init: None, vm_death: Some(vm_death) };
    let host = match JvmtiHost::install(vm, lifecycle) {
        Ok(host) => host,
        Err(e) => {
            error!(error = %e, "cannot set up JVMTI");
            return jni::JNI_ERR;
        }
    };
    if let Err(e) = host.jvmti().set_event_notification_mode(true, jvmti::JVMTI_EVENT_VM_DEATH) {
        warn!(error = %host.jvmti().describe_error(e), "cannot enable VMDeath, classes stay instrumented on exit");
    }
    match panic::catch_unwind(AssertUnwindSafe(|| start(host, &options, factory))) {
        Ok(Ok(())) => jni::JNI_OK,
        Ok(Err(e)) => {
            error!(error = %e, "cannot initialize instrumentation");
            jni::JNI_ERR
        }
        Err(_) => {
            error!("initialization panicked");
            jni::JNI_ERR
        }
    }
}

unsafe extern "system" fn vm_death(_jvmti_env: *mut jvmti::jvmtiEnv, _jni_env: *mut jni::JNIEnv) {
    match panic::catch_unwind(AssertUnwindSafe(|| reset_if_active(ApmAgent::global()))) {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "reset at VM death failed"),
        Err(_) => error!("reset at VM death panicked"),
    }
}

/// Restores instrumented classes; `Ok(false)` when nothing was installed.
fn reset_if_active(agent: &ApmAgent) -> Result<bool, AgentError> {
    if !agent.is_initialized() {
        return Ok(false);
    }
    agent.reset()?;
    Ok(true)
}

/// The JVM is in its dead phase here and refuses retransformation, so the
/// state is dropped without touching any class.
pub fn on_unload() {
    if ApmAgent::global().discard() {
        debug!("dropped instrumentation state on unload");
    }
}

/// Parses the option string and installs logging.
unsafe fn startup_options(options: *const c_char) -> Option<AgentOptions> {
    let raw = if options.is_null() { "" } else { CStr::from_ptr(options).to_str().unwrap_or("") };
    let parsed = AgentOptions::parse(raw);
    let level = parsed.as_ref().ok().and_then(|o| o.get(LOG_LEVEL));
    logging::init(level.as_deref());
    match parsed {
        Ok(options) => Some(options),
        Err(e) => {
            error!(error = %e, "invalid agent options {:?}", raw);
            None
        }
    }
}

fn start(host: Arc<JvmtiHost>, options: &AgentOptions, factory: DescriptorFactory) -> Result<(), AgentError> {
    let source: Arc<dyn ConfigurationSource> =
        Arc::new(CompositeSource::new().with(Arc::new(options.clone())).with(Arc::new(EnvironmentSource)));
    let agent_jar = source.get(AGENT_JAR).map(PathBuf::from);

    let hook_locator = match &agent_jar {
        Some(jar) => {
            host.add_to_bootstrap_search(jar)?;
            jar_locator(jar)?
        }
        None => {
            warn!("no {} option, hook classes cannot be located", AGENT_JAR);
            Arc::new(InMemoryLocator::new()) as Arc<dyn ClassFileLocator>
        }
    };

    let tracer = Tracer::builder().with_source(source).build()?;
    let context = AgentContext::new(agent_jar.clone(), hook_locator);
    let descriptors = factory(&context);
    info!(
        descriptors = descriptors.len(),
        retransform = host.is_retransform_classes_supported(),
        "starting instrumentation"
    );
    ApmAgent::global().initialize_with(tracer, host, agent_jar, &descriptors)
}

#[cfg(feature = "agent-jar")]
fn jar_locator(jar: &Path) -> Result<Arc<dyn ClassFileLocator>, LocatorError> {
    Ok(Arc::new(crate::locator::JarLocator::open(jar)?))
}

#[cfg(not(feature = "agent-jar"))]
fn jar_locator(jar: &Path) -> Result<Arc<dyn ClassFileLocator>, LocatorError> {
    warn!("built without agent-jar support, cannot read hook classes from {}", jar.display());
    Ok(Arc::new(InMemoryLocator::new()))
}

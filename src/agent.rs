//! Process-wide instrumentation state and its lifecycle.
//!
//! ```text
//! UNINITIALIZED --initialize--> ACTIVE --reset--> UNINITIALIZED
//! ```
//!
//! A second `initialize` while active logs a warning and does nothing.
//! `reset` while uninitialized is an [`AgentError::IllegalState`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::host::{ClassFileTransformer, HostError, InstrumentationHost};
use crate::instrumentation::DescriptorSource;
use crate::locator::LocatorError;
use crate::policy::is_included;
use crate::tracer::Tracer;
use crate::transform::{AgentBuilder, Pipeline};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Locator(#[from] LocatorError),
}

/// Host and installed pipeline exist together or not at all.
struct Active {
    host: Arc<dyn InstrumentationHost>,
    pipeline: Arc<Pipeline>,
    transformer: Arc<dyn ClassFileTransformer>,
}

struct AgentState {
    active: Option<Active>,
    agent_jar: Option<PathBuf>,
}

pub struct ApmAgent {
    state: Mutex<AgentState>,
}

impl Default for ApmAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ApmAgent {
    pub const fn new() -> Self {
        ApmAgent { state: parking_lot::const_mutex(AgentState { active: None, agent_jar: None }) }
    }

    /// The instance the native entry points drive.
    pub fn global() -> &'static ApmAgent {
        static GLOBAL: ApmAgent = ApmAgent::new();
        &GLOBAL
    }

    /// Records where the agent jar lives, reads configuration from the
    /// environment and installs the instrumentation.
    pub fn initialize(
        &self,
        host: Arc<dyn InstrumentationHost>,
        agent_jar: Option<PathBuf>,
        source: &dyn DescriptorSource,
    ) -> Result<(), AgentError> {
        let tracer = Tracer::builder().build()?;
        self.initialize_with(tracer, host, agent_jar, source)
    }

    /// Like [`initialize`](Self::initialize) with an explicit tracer.
    pub fn initialize_with(
        &self,
        tracer: Tracer,
        host: Arc<dyn InstrumentationHost>,
        agent_jar: Option<PathBuf>,
        source: &dyn DescriptorSource,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock();
        state.agent_jar = agent_jar;
        Self::install(&mut state, &tracer, host, source)
    }

    /// Discovers, filters, compiles and installs. Keeps the agent jar
    /// location as it is.
    pub fn init_instrumentation(
        &self,
        tracer: &Tracer,
        host: Arc<dyn InstrumentationHost>,
        source: &dyn DescriptorSource,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock();
        Self::install(&mut state, tracer, host, source)
    }

    fn install(
        state: &mut AgentState,
        tracer: &Tracer,
        host: Arc<dyn InstrumentationHost>,
        source: &dyn DescriptorSource,
    ) -> Result<(), AgentError> {
        if state.active.is_some() {
            warn!("Instrumentation has already been initialized");
            return Ok(());
        }

        let mut builder = AgentBuilder::new();
        for instrumentation in source.descriptors() {
            if is_included(instrumentation.as_ref(), tracer.core()) {
                builder = builder.apply(instrumentation.as_ref(), tracer);
            } else {
                debug!(advice = instrumentation.name(), "advice {} is disabled", instrumentation.name());
            }
        }
        let pipeline = builder.build();
        let transformer = pipeline.install_on(host.as_ref())?;
        state.active = Some(Active { host, pipeline, transformer });
        Ok(())
    }

    /// Unregisters the pipeline and restores the classes it rewrote.
    ///
    /// The state is cleared even when restoring fails; the error is
    /// returned after the fact.
    pub fn reset(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock();
        let active = state.active.take().ok_or(AgentError::IllegalState("Reset was called before init"))?;
        let restored = active.pipeline.reset_on(active.host.as_ref(), &active.transformer)?;
        debug!("restored {} classes", restored);
        Ok(())
    }

    /// Forgets the installed pipeline without calling into the host, for
    /// when the host can no longer retransform. Returns whether anything
    /// was installed.
    pub fn discard(&self) -> bool {
        self.state.lock().active.take().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// The pipeline currently installed, if any.
    pub fn installed_pipeline(&self) -> Option<Arc<Pipeline>> {
        self.state.lock().active.as_ref().map(|a| Arc::clone(&a.pipeline))
    }

    pub fn agent_jar(&self) -> Option<PathBuf> {
        self.state.lock().agent_jar.clone()
    }

    /// Directory containing the agent jar; `None` when unknown, e.g. in
    /// tests.
    pub fn agent_home(&self) -> Option<PathBuf> {
        self.state.lock().agent_jar.as_deref().and_then(Path::parent).map(Path::to_path_buf)
    }
}

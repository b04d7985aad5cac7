//! # apm-bci
//!
//! The bytecode instrumentation engine of a JVM application performance
//! monitoring agent, as a native JVMTI agent library.
//!
//! Instrumentation modules are plain Rust values implementing
//! [`Instrumentation`](instrumentation::Instrumentation): a type matcher, a
//! method matcher, a class loader matcher, group names for switching them
//! off, and a reference to a Java hook class with static `onMethodEnter()`
//! and/or `onMethodExit()` methods. The engine decides which modules are
//! active, compiles them into one transformer, installs it through JVMTI
//! and rewrites matching methods so they call the hooks around their
//! original body.
//!
//! ## Quick Start
//!
//! **1. Configure Cargo.toml:**
//! ```toml
//! [lib]
//! crate-type = ["cdylib"]
//!
//! [dependencies]
//! apm-bci = "0.1"
//! ```
//!
//! **2. Describe what to instrument (src/lib.rs):**
//! ```rust,ignore
//! use std::sync::Arc;
//! use apm_bci::prelude::*;
//!
//! struct JulEcsFormatterInstrumentation { hook: HookReference }
//!
//! impl Instrumentation for JulEcsFormatterInstrumentation {
//!     fn type_matcher(&self) -> Junction<TypeDescription> {
//!         named("co.elastic.logging.jul.EcsFormatter")
//!     }
//!     fn method_matcher(&self) -> Junction<MethodDescription> {
//!         named("getMdcEntries")
//!     }
//!     fn group_names(&self) -> Vec<String> {
//!         vec!["logging".into(), "jul-ecs".into()]
//!     }
//!     fn hook(&self) -> HookReference {
//!         self.hook.clone()
//!     }
//! }
//!
//! fn catalog(ctx: &AgentContext) -> Vec<Arc<dyn Instrumentation>> {
//!     vec![Arc::new(JulEcsFormatterInstrumentation {
//!         hook: ctx.hook("co.elastic.apm.agent.jul.JulEcsAdvice"),
//!     })]
//! }
//!
//! export_agent!(catalog);
//! ```
//!
//! **3. Run:**
//! ```bash
//! java -agentpath:./libmy_agent.so=agent_jar=/opt/apm/hooks.jar,disabled_instrumentations=jdbc MyApp
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        export_agent!  /  bootstrap (OnLoad, VMInit)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  agent::ApmAgent      initialize / reset state machine   │
//! │  policy, transform    activation, rules, pipeline        │
//! │  matcher, description predicates over class files        │
//! │  weave, code          constant pool + Code rewriting     │
//! ├─────────────────────────────────────────────────────────┤
//! │  host traits  <-  jvmti_host (ClassFileLoadHook, JNI)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  env: Jvmti, JniEnv, LocalRef    sys: raw jni / jvmti    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`matcher`] | Composable type, method and class loader predicates |
//! | [`instrumentation`] | The contract instrumentation modules implement |
//! | [`policy`] | Which modules are active for a configuration |
//! | [`transform`] | Rules, the agent builder and the installed pipeline |
//! | [`agent`] | Process-wide initialize/reset lifecycle |
//! | [`ignore`] | Classes that are never instrumented |
//! | [`classfile`] | Class file parser |
//! | [`weave`] | Hook call insertion |
//! | [`config`] | Configuration sources and core settings |
//! | [`env`] | JVMTI and JNI wrappers |
//!
//! ## Configuration
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `instrument` | `true` | Global switch; modules may opt out of it |
//! | `disabled_instrumentations` | empty | Comma separated group names |
//! | `log_level` | `info` | Filter when `APM_LOG` is unset |
//! | `agent_jar` | none | Jar holding the hook classes |
//!
//! Keys come from the agent options string, then `ELASTIC_APM_<KEY>`
//! environment variables.

pub mod sys;
pub mod env;

// Implementation modules (use `env` module for the public API)
#[doc(hidden)]
pub mod jvmti_wrapper;
#[doc(hidden)]
pub mod jni_wrapper;

pub mod classfile;
pub mod code;
pub mod weave;

pub mod description;
pub mod matcher;
pub mod instrumentation;
pub mod config;
pub mod tracer;
pub mod policy;
pub mod ignore;
pub mod locator;
pub mod host;
pub mod transform;
pub mod agent;

pub mod jvmti_host;
pub mod bootstrap;
pub mod logging;

pub mod prelude;

/// Exports the JVM entry points for an agent library.
///
/// `$catalog` is a `fn(&AgentContext) -> Vec<Arc<dyn Instrumentation>>`
/// invoked once the agent is ready to install.
///
/// ```rust,ignore
/// apm_bci::export_agent!(catalog);
/// ```
#[macro_export]
macro_rules! export_agent {
    ($catalog:path) => {
        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::os::raw::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            $crate::bootstrap::on_load(vm, options, $catalog)
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnAttach(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::os::raw::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            $crate::bootstrap::on_attach(vm, options, $catalog)
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnUnload(_vm: *mut $crate::sys::jni::JavaVM) {
            $crate::bootstrap::on_unload();
        }
    };
}

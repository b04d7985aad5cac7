//! Common imports for writing instrumentation modules.
//!
//! This prelude is intentionally small. It covers what a module and its
//! catalog function need while avoiding over-broad re-exports.

pub use crate::bootstrap::AgentContext;
pub use crate::description::{ClassLoaderDescription, MethodDescription, TypeDescription};
pub use crate::export_agent;
pub use crate::instrumentation::{BoxError, HookReference, Instrumentation};
pub use crate::matcher::{
    any, has_super_type, is_bootstrap_class_loader, is_method, is_public, is_static, named, name_starts_with, none,
    not, returns, takes_arguments, Junction,
};
pub use crate::tracer::Tracer;

#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod error;
mod gate;
mod graph;
mod hash;
pub mod io;
mod pipeline;
mod report;
mod runner;
mod task;
#[cfg(feature = "live")]
mod watch;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "live")]
use std::sync::Arc;

use console::style;

pub use crate::cache::FingerprintCache;
pub use crate::config::{DeployTarget, FailurePolicy, Profile, RunConfig};
pub use crate::error::*;
pub use crate::gate::GateSet;
pub use crate::graph::Registry;
pub use crate::hash::{Fingerprint, Hash32};
pub use crate::pipeline::{
    BuildPipeline, DeployPipeline, ProjectLayout, Sequence, Toolchain, clean_action,
    copy_assets_action, wire_build, wire_deploy,
};
#[cfg(feature = "live")]
pub use crate::pipeline::standard_bindings;
pub use crate::report::{BuildReport, Record, Reporter, Severity};
pub use crate::runner::{RunContext, RunState, RunSummary, run};
pub use crate::task::{Action, ActionResult, TaskContext, TaskId, TaskSpec};
#[cfg(feature = "live")]
pub use crate::watch::{WatchBinding, WatchHandle};

/// This value controls whether the orchestrator runs in the `Build` or
/// the `Watch` mode. In `Build` mode every targeted task runs once and
/// the process is expected to surface the run's terminal state. In
/// `Watch` mode the initial build is followed by a watch session which
/// re-runs the affected tasks on filesystem changes and never tears the
/// process down on a task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One-shot build.
    Build,
    /// Interactive rebuild loop.
    Watch,
}

/// The orchestrator facade: a task registry plus the shared run state
/// (configuration, aggregator, cache, gates) passed into every run.
pub struct Project {
    registry: Registry,
    context: RunContext,
}

impl Project {
    pub fn new(config: RunConfig) -> Self {
        Self {
            registry: Registry::new(),
            context: RunContext::new(config),
        }
    }

    pub fn register(&mut self, spec: TaskSpec) -> Result<TaskId, RegistryError> {
        self.registry.register(spec)
    }

    /// Start a run-sequence composition over this project's registry.
    pub fn sequence(&mut self) -> Sequence<'_> {
        Sequence::new(&mut self.registry)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Run the targets once and report. The returned summary carries the
    /// exit code the surrounding process should use.
    pub fn build(&self, targets: &[TaskId]) -> Result<RunSummary, RegistryError> {
        eprintln!(
            "Running {} in {} mode.",
            style("Kumade").red(),
            style("build").blue()
        );

        run(&self.registry, targets, &self.context, Mode::Build)
    }

    /// Run the initial build, then keep rebuilding on filesystem changes
    /// until the returned handle is stopped. Task errors are reported
    /// and never terminate the session.
    #[cfg(feature = "live")]
    pub fn watch(
        self,
        targets: &[TaskId],
        bindings: Vec<WatchBinding>,
    ) -> Result<WatchHandle, KumadeError> {
        eprintln!(
            "Running {} in {} mode.",
            style("Kumade").red(),
            style("watch").blue()
        );

        let mut context = self.context;
        // Watch sessions always keep going on task errors; the failure
        // policy only ever decides the fate of one-shot runs.
        context.config.on_failure = FailurePolicy::KeepAlive;

        let registry = Arc::new(self.registry);
        let context = Arc::new(context);

        run(&registry, targets, &context, Mode::Watch)?;

        let handle = watch::watch(registry, context, bindings)?;
        Ok(handle)
    }
}

#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

//! Task handles, the action contract and the per-task execution context.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::Utf8PathBuf;
use petgraph::graph::NodeIndex;

use crate::Mode;
use crate::cache::FingerprintCache;
use crate::config::RunConfig;
use crate::gate::GateSet;
use crate::report::{Reporter, Severity};

/// What a task action hands back on success: the output paths it wrote.
/// The watch subsystem forwards these to the live client after a
/// successful rebuild.
pub type ActionResult = anyhow::Result<Vec<Utf8PathBuf>>;

/// An opaque unit of build work — a template renderer, a stylesheet
/// compiler, a linter, a publisher. The engine decides when it runs; the
/// action reports per-input diagnostics through the [`TaskContext`] and
/// signals overall success or failure through its return value.
pub trait Action: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> ActionResult;
}

impl<F> Action for F
where
    F: Fn(&TaskContext) -> ActionResult + Send + Sync,
{
    fn run(&self, ctx: &TaskContext) -> ActionResult {
        self(ctx)
    }
}

/// A type-safe reference to a task in the build graph.
///
/// A `TaskId` is a lightweight, copyable token handed out at registration
/// time. Dependencies and watch bindings are declared in terms of these
/// tokens, so a task that was never registered cannot be named at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) NodeIndex);

impl TaskId {
    /// Returns the underlying `NodeIndex` of the task in the graph.
    pub fn index(&self) -> NodeIndex {
        self.0
    }
}

/// Declarative description of a task, consumed by
/// [`Registry::register`](crate::Registry::register).
pub struct TaskSpec {
    pub(crate) name: Box<str>,
    pub(crate) action: Arc<dyn Action>,
    pub(crate) deps: Vec<TaskId>,
    pub(crate) group: Option<Box<str>>,
    pub(crate) guards: Option<Box<str>>,
    pub(crate) requires: Option<Box<str>>,
}

impl TaskSpec {
    pub fn new(name: impl Into<Box<str>>, action: impl Action + 'static) -> Self {
        Self::from_arc(name, Arc::new(action))
    }

    pub fn from_arc(name: impl Into<Box<str>>, action: Arc<dyn Action>) -> Self {
        Self {
            name: name.into(),
            action,
            deps: Vec::new(),
            group: None,
            guards: None,
            requires: None,
        }
    }

    /// Declare hard dependencies: tasks which must have reached a
    /// terminal state before this one starts, and which are pulled into
    /// every run that targets this task.
    pub fn after(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.deps.extend(deps);
        self
    }

    /// Tag this task as a member of a named parallel group. Members run
    /// concurrently with their siblings, and the group as a whole is one
    /// step of the outer sequential order.
    pub fn group(mut self, name: impl Into<Box<str>>) -> Self {
        self.group = Some(name.into());
        self
    }

    /// This task guards a validity unit: the unit is reopened before the
    /// action runs and closed again if the action fails or reports any
    /// error.
    pub fn guards(mut self, unit: impl Into<Box<str>>) -> Self {
        self.guards = Some(unit.into());
        self
    }

    /// This task's action is skipped entirely — no work, no records —
    /// while the named unit's gate is closed.
    pub fn requires(mut self, unit: impl Into<Box<str>>) -> Self {
        self.requires = Some(unit.into());
        self
    }
}

/// Everything a task action may touch during one run, passed in
/// explicitly so concurrent runs (and tests) never share hidden state.
pub struct TaskContext<'run> {
    /// Whether this run is a one-shot build or a watch-triggered rebuild.
    pub mode: Mode,
    /// The immutable run configuration resolved once per invocation.
    pub config: &'run RunConfig,
    pub cache: &'run FingerprintCache,
    pub gates: &'run GateSet,
    source: &'run str,
    reporter: &'run Reporter,
    local_errors: AtomicUsize,
}

impl<'run> TaskContext<'run> {
    pub(crate) fn new(
        mode: Mode,
        config: &'run RunConfig,
        cache: &'run FingerprintCache,
        gates: &'run GateSet,
        reporter: &'run Reporter,
        source: &'run str,
    ) -> Self {
        Self {
            mode,
            config,
            cache,
            gates,
            source,
            reporter,
            local_errors: AtomicUsize::new(0),
        }
    }

    /// The name of the task this context belongs to.
    pub fn source(&self) -> &str {
        self.source
    }

    pub fn error(&self, message: impl Into<String>) {
        self.report(Severity::Error, message.into(), None);
    }

    pub fn error_with(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.report(Severity::Error, message.into(), Some(detail.into()));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.report(Severity::Warning, message.into(), None);
    }

    pub fn warning_with(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.report(Severity::Warning, message.into(), Some(detail.into()));
    }

    /// Whether any task in the current run has recorded an error so far.
    pub fn run_has_failures(&self) -> bool {
        self.reporter.has_failures()
    }

    /// Errors recorded through this context alone, used for gate
    /// decisions after a guard finishes.
    pub(crate) fn local_errors(&self) -> usize {
        self.local_errors.load(Ordering::Relaxed)
    }

    fn report(&self, severity: Severity, message: String, detail: Option<String>) {
        if severity == Severity::Error {
            self.local_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.reporter.record(severity, self.source, message, detail);
    }
}

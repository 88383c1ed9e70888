//! The batch scheduler.
//!
//! A run resolves its targets into batches, then walks the batches
//! strictly in sequence. Every member of a batch executes concurrently
//! on the rayon pool and the batch completes only once all members have
//! reached a terminal state — a failing member never aborts its
//! siblings, so a single invocation surfaces as many problems as it can.
//! Failures propagate through the error aggregator, never through the
//! call stack: an action that returns an error or panics becomes a
//! recorded diagnostic, and the run carries on.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Instant;

use camino::Utf8PathBuf;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::Mode;
use crate::cache::FingerprintCache;
use crate::config::{FailurePolicy, RunConfig};
use crate::error::RegistryError;
use crate::gate::GateSet;
use crate::graph::Registry;
use crate::report::{BuildReport, Reporter, Severity};
use crate::task::{TaskContext, TaskId};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, order not yet resolved.
    Pending,
    /// Batches are executing.
    Running,
    /// Terminal: the aggregator held no errors when the run finished.
    Succeeded,
    /// Terminal: at least one error was recorded.
    Failed,
}

/// The shared mutable state of the orchestrator, passed explicitly into
/// every run. The aggregator is drained per run; the cache and the gates
/// persist across watch-triggered rebuilds.
#[derive(Debug, Default)]
pub struct RunContext {
    pub config: RunConfig,
    pub reporter: Reporter,
    pub cache: FingerprintCache,
    pub gates: GateSet,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }
}

/// Outcome of one run: terminal state, the consolidated report, and
/// every output path the actions wrote.
#[derive(Debug)]
pub struct RunSummary {
    pub state: RunState,
    pub report: BuildReport,
    pub outputs: Vec<Utf8PathBuf>,
    policy: FailurePolicy,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        self.state == RunState::Failed
    }

    /// Whether the surrounding process should exit nonzero, honoring the
    /// configured [`FailurePolicy`].
    pub fn should_fail_process(&self) -> bool {
        self.policy == FailurePolicy::ExitNonZero && self.failed()
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.should_fail_process() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }
}

/// Execute `targets` and their transitive requirements.
///
/// The consolidated report is rendered to standard output at the end of
/// the run, one-shot and watch-triggered alike.
pub fn run(
    registry: &Registry,
    targets: &[TaskId],
    ctx: &RunContext,
    mode: Mode,
) -> Result<RunSummary, RegistryError> {
    let s = Instant::now();
    let batches = registry.resolve_order(targets)?;
    let total: usize = batches.iter().map(Vec::len).sum();

    tracing::debug!("run resolved into {} batches, {} tasks", batches.len(), total);

    let bar = ProgressBar::new(total as u64).with_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("Error setting progress bar template")
            .progress_chars("#>-"),
    );

    let active = Mutex::new(HashSet::new());
    let outputs = Mutex::new(Vec::new());

    for batch in &batches {
        batch.par_iter().for_each(|&id| {
            let node = registry.node(id);

            if let Some(unit) = &node.requires
                && !ctx.gates.get(unit)
            {
                tracing::debug!("skipping '{}', unit '{}' is invalid", node.name, unit);
                bar.inc(1);
                return;
            }

            if let Some(unit) = &node.guards {
                ctx.gates.reset(unit);
            }

            {
                let mut active = active.lock().unwrap();
                active.insert(node.name.to_string());
                bar.set_message(format_active(&active));
            }

            let task_ctx = TaskContext::new(
                mode,
                &ctx.config,
                &ctx.cache,
                &ctx.gates,
                &ctx.reporter,
                &node.name,
            );

            // If the action panics it must not take the batch down with
            // it; the panic becomes an ordinary error record.
            let outcome = catch_unwind(AssertUnwindSafe(|| node.action.run(&task_ctx)));

            let clean = match outcome {
                Ok(Ok(paths)) => {
                    outputs.lock().unwrap().extend(paths);
                    task_ctx.local_errors() == 0
                }
                Ok(Err(err)) => {
                    let detail = err
                        .chain()
                        .skip(1)
                        .map(|cause| cause.to_string())
                        .collect::<Vec<_>>()
                        .join("\n");
                    ctx.reporter.record(
                        Severity::Error,
                        node.name.clone(),
                        err.to_string(),
                        (!detail.is_empty()).then_some(detail),
                    );
                    false
                }
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        format!("Task panicked: {s}")
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        format!("Task panicked: {s}")
                    } else {
                        String::from("Task panicked with unknown payload")
                    };
                    ctx.reporter.record(Severity::Error, node.name.clone(), msg, None);
                    false
                }
            };

            if let Some(unit) = &node.guards {
                ctx.gates.set(unit, clean);
            }

            {
                let mut active = active.lock().unwrap();
                active.remove(&*node.name);
                bar.set_message(format_active(&active));
                bar.inc(1);
            }
        });
    }

    let state = if ctx.reporter.has_failures() {
        RunState::Failed
    } else {
        RunState::Succeeded
    };

    bar.finish_with_message(format!("Finished tasks {}", crate::io::as_overhead(s)));

    let report = ctx.reporter.drain();
    println!("{report}");

    Ok(RunSummary {
        state,
        report,
        outputs: outputs.into_inner().unwrap(),
        policy: ctx.config.on_failure,
    })
}

fn format_active(active: &HashSet<String>) -> String {
    const MAX: usize = 5;
    let mut names: Vec<_> = active.iter().cloned().collect();
    names.sort();

    if names.len() <= MAX {
        names.join(", ")
    } else {
        format!("{}… ({} total)", names[..MAX].join(", "), names.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::hash::{Fingerprint, Hash32};
    use crate::task::{ActionResult, TaskSpec};

    fn noop(_: &TaskContext) -> ActionResult {
        Ok(Vec::new())
    }

    #[test]
    fn failing_sibling_does_not_abort_the_batch() {
        let mut registry = Registry::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let _bad = registry
            .register(TaskSpec::new("sass", |ctx: &TaskContext| -> ActionResult {
                ctx.error("app/styles/main.scss");
                Ok(Vec::new())
            }))
            .unwrap();
        let counter = ran.clone();
        let _good = registry
            .register(TaskSpec::new("pug", move |_: &TaskContext| -> ActionResult {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }))
            .unwrap();

        let ctx = RunContext::default();
        let targets: Vec<_> = ["sass", "pug"]
            .iter()
            .map(|n| registry.lookup(n).unwrap())
            .collect();
        let summary = run(&registry, &targets, &ctx, Mode::Build).unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(summary.failed());
        assert_eq!(summary.report.errors, 1);
    }

    #[test]
    fn action_error_becomes_a_record() {
        let mut registry = Registry::new();
        let task = registry
            .register(TaskSpec::new("copy", |_: &TaskContext| -> ActionResult {
                Err(anyhow::anyhow!("missing asset directory"))
            }))
            .unwrap();

        let ctx = RunContext::default();
        let summary = run(&registry, &[task], &ctx, Mode::Build).unwrap();

        assert!(summary.failed());
        assert_eq!(summary.report.records.len(), 1);
        assert_eq!(summary.report.records[0].message, "missing asset directory");
    }

    #[test]
    fn panics_are_contained() {
        let mut registry = Registry::new();
        let survivor = Arc::new(AtomicUsize::new(0));

        let _bad = registry
            .register(TaskSpec::new("js", |_: &TaskContext| -> ActionResult {
                panic!("transpiler blew up")
            }))
            .unwrap();
        let counter = survivor.clone();
        let _good = registry
            .register(TaskSpec::new("copy", move |_: &TaskContext| -> ActionResult {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }))
            .unwrap();

        let ctx = RunContext::default();
        let targets: Vec<_> = ["js", "copy"]
            .iter()
            .map(|n| registry.lookup(n).unwrap())
            .collect();
        let summary = run(&registry, &targets, &ctx, Mode::Build).unwrap();

        assert_eq!(survivor.load(Ordering::SeqCst), 1);
        assert!(summary.failed());
        assert!(summary.report.records[0].message.contains("panicked"));
    }

    #[test]
    fn closed_gate_suppresses_dependent_work() {
        let mut registry = Registry::new();
        let fail_once = Arc::new(AtomicBool::new(true));
        let compiled = Arc::new(AtomicUsize::new(0));

        let failing = fail_once.clone();
        let lint = registry
            .register(
                TaskSpec::new("js-lint", move |ctx: &TaskContext| -> ActionResult {
                    if failing.swap(false, Ordering::SeqCst) {
                        ctx.error_with("app/scripts/app.jsx", "[3:10]  unexpected token");
                    }
                    Ok(Vec::new())
                })
                .guards("scripts"),
            )
            .unwrap();
        let counter = compiled.clone();
        let compile = registry
            .register(
                TaskSpec::new("js", move |_: &TaskContext| -> ActionResult {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["public/js/app.js".into()])
                })
                .after([lint])
                .requires("scripts"),
            )
            .unwrap();

        let ctx = RunContext::default();

        // First run: the lint error closes the gate, the compile step
        // does nothing and records nothing of its own.
        let summary = run(&registry, &[compile], &ctx, Mode::Build).unwrap();
        assert_eq!(compiled.load(Ordering::SeqCst), 0);
        assert!(summary.failed());
        assert_eq!(summary.report.errors, 1);
        assert!(summary.outputs.is_empty());

        // Clean rerun: the guard reopens the gate and the dependent
        // executes normally.
        let summary = run(&registry, &[compile], &ctx, Mode::Build).unwrap();
        assert_eq!(compiled.load(Ordering::SeqCst), 1);
        assert!(!summary.failed());
        assert_eq!(summary.outputs, vec![Utf8PathBuf::from("public/js/app.js")]);
    }

    #[test]
    fn report_counts_match_record_calls_and_drain_once() {
        let mut registry = Registry::new();
        let a = registry
            .register(TaskSpec::new("a", |ctx: &TaskContext| -> ActionResult {
                ctx.error("one");
                ctx.warning("two");
                Ok(Vec::new())
            }))
            .unwrap();
        let b = registry
            .register(TaskSpec::new("b", |ctx: &TaskContext| -> ActionResult {
                ctx.warning("three");
                Ok(Vec::new())
            }))
            .unwrap();

        let ctx = RunContext::default();
        let summary = run(&registry, &[a, b], &ctx, Mode::Build).unwrap();
        assert_eq!(summary.report.errors + summary.report.warnings, 3);
        assert_eq!(summary.report.records.len(), 3);

        // Nothing carries over into the next run.
        let summary = run(&registry, &[a, b], &ctx, Mode::Build).unwrap();
        assert_eq!(summary.report.records.len(), 3);
    }

    #[test]
    fn cached_inputs_are_not_reprocessed() {
        let inputs = ["app/assets/a.png", "app/assets/b.png"];
        let processed = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let counter = processed.clone();
        let copy = registry
            .register(TaskSpec::new("copy", move |ctx: &TaskContext| -> ActionResult {
                for input in inputs {
                    let fp = Fingerprint::new(input, Hash32::hash(input.as_bytes()));
                    if ctx.cache.has("copy", &fp) {
                        continue;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.cache.remember("copy", fp);
                }
                Ok(Vec::new())
            }))
            .unwrap();

        let ctx = RunContext::default();

        run(&registry, &[copy], &ctx, Mode::Build).unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 2);

        // Unchanged inputs all hit the cache.
        run(&registry, &[copy], &ctx, Mode::Build).unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 2);

        // A cleared partition means everything is reprocessed.
        ctx.cache.invalidate("copy");
        run(&registry, &[copy], &ctx, Mode::Build).unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn batches_run_strictly_in_sequence() {
        let mut registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        let first = registry
            .register(TaskSpec::new("clean", move |_: &TaskContext| -> ActionResult {
                log.lock().unwrap().push("clean");
                Ok(Vec::new())
            }))
            .unwrap();
        let log = order.clone();
        let second = registry
            .register(
                TaskSpec::new("sass", move |_: &TaskContext| -> ActionResult {
                    log.lock().unwrap().push("sass");
                    Ok(Vec::new())
                })
                .after([first]),
            )
            .unwrap();

        let ctx = RunContext::default();
        run(&registry, &[second], &ctx, Mode::Build).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["clean", "sass"]);
    }

    #[test]
    fn exit_code_honors_failure_policy() {
        let mut registry = Registry::new();
        let bad = registry
            .register(TaskSpec::new("sass", |ctx: &TaskContext| -> ActionResult {
                ctx.error("main.scss");
                Ok(Vec::new())
            }))
            .unwrap();

        let ctx = RunContext::default();
        let summary = run(&registry, &[bad], &ctx, Mode::Build).unwrap();
        assert!(summary.should_fail_process());

        let ctx = RunContext::new(RunConfig {
            on_failure: FailurePolicy::KeepAlive,
            ..RunConfig::default()
        });
        let summary = run(&registry, &[bad], &ctx, Mode::Watch).unwrap();
        assert!(summary.failed());
        assert!(!summary.should_fail_process());
    }

    #[test]
    fn pending_run_with_noop_targets_succeeds() {
        let mut registry = Registry::new();
        let task = registry.register(TaskSpec::new("report", noop)).unwrap();

        let ctx = RunContext::default();
        let summary = run(&registry, &[task], &ctx, Mode::Build).unwrap();
        assert_eq!(summary.state, RunState::Succeeded);
    }
}

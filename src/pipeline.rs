//! Reusable pipeline compositions.
//!
//! A pipeline is nothing but dependency declarations over the registry —
//! there is no separate executor. The [`Sequence`] builder contributes
//! ordering edges between consecutive steps (run-sequence semantics),
//! and an aggregate task at the end requires every step, so targeting
//! the aggregate runs the whole pipeline while a watch binding can still
//! target a single step without dragging the rest along.

use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::config::DeployTarget;
use crate::error::RegistryError;
use crate::graph::Registry;
use crate::hash::Fingerprint;
use crate::task::{Action, ActionResult, TaskContext, TaskId, TaskSpec};
#[cfg(feature = "live")]
use crate::watch::WatchBinding;

/// Builder for run-sequence composition: each step runs after the
/// previous one, a group's members run concurrently as a single step.
pub struct Sequence<'r> {
    registry: &'r mut Registry,
    prev: Vec<TaskId>,
    seen: Vec<TaskId>,
}

impl<'r> Sequence<'r> {
    pub fn new(registry: &'r mut Registry) -> Self {
        Self {
            registry,
            prev: Vec::new(),
            seen: Vec::new(),
        }
    }

    /// Append one sequential step.
    pub fn step(mut self, task: TaskId) -> Result<Self, RegistryError> {
        for &prev in &self.prev {
            self.registry.add_order(prev, task)?;
        }
        self.seen.push(task);
        self.prev = vec![task];
        Ok(self)
    }

    /// Append a set of tasks which run concurrently as one step.
    pub fn group(mut self, tasks: impl IntoIterator<Item = TaskId>) -> Result<Self, RegistryError> {
        let tasks: Vec<_> = tasks.into_iter().collect();
        for &task in &tasks {
            for &prev in &self.prev {
                self.registry.add_order(prev, task)?;
            }
            self.seen.push(task);
        }
        self.prev = tasks;
        Ok(self)
    }

    /// Register an aggregate task requiring every step of the sequence,
    /// so the whole pipeline runs whenever the aggregate is targeted.
    pub fn finish(
        self,
        name: impl Into<Box<str>>,
        action: impl Action + 'static,
    ) -> Result<TaskId, RegistryError> {
        let seen = self.seen;
        self.registry.register(TaskSpec::new(name, action).after(seen))
    }
}

/// Source and output directory layout of the project.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub src: Utf8PathBuf,
    pub dest: Utf8PathBuf,
    pub views: Utf8PathBuf,
    pub styles: Utf8PathBuf,
    pub scripts: Utf8PathBuf,
    pub assets: Utf8PathBuf,
    pub dest_styles: Utf8PathBuf,
    pub dest_scripts: Utf8PathBuf,
}

impl ProjectLayout {
    pub fn rooted(src: impl AsRef<str>, dest: impl AsRef<str>) -> Self {
        let src = Utf8PathBuf::from(src.as_ref());
        let dest = Utf8PathBuf::from(dest.as_ref());
        Self {
            views: src.join("views"),
            styles: src.join("styles"),
            scripts: src.join("scripts"),
            assets: src.join("assets"),
            dest_styles: dest.join("css"),
            dest_scripts: dest.join("js"),
            src,
            dest,
        }
    }
}

impl Default for ProjectLayout {
    fn default() -> Self {
        Self::rooted("app", "public")
    }
}

/// The compiler-shaped actions of the build pipeline, injected by the
/// caller. Kumade never links a template engine, a CSS compiler or a
/// linter itself.
pub struct Toolchain {
    pub templates: Arc<dyn Action>,
    pub styles: Arc<dyn Action>,
    pub app_styles: Arc<dyn Action>,
    pub lint_scripts: Arc<dyn Action>,
    pub scripts: Arc<dyn Action>,
    pub lib_scripts: Arc<dyn Action>,
    pub lint_app_scripts: Arc<dyn Action>,
    pub app_scripts: Arc<dyn Action>,
}

/// Handles to every task of the wired build pipeline.
pub struct BuildPipeline {
    pub build: TaskId,
    pub clean: TaskId,
    pub templates: TaskId,
    pub styles: TaskId,
    pub app_styles: TaskId,
    pub lint_scripts: TaskId,
    pub scripts: TaskId,
    pub lib_scripts: TaskId,
    pub lint_app_scripts: TaskId,
    pub app_scripts: TaskId,
    pub copy_assets: TaskId,
}

/// The validity unit closed by a failed build, consulted by publishers.
const DEPLOY_UNIT: &str = "deploy";

/// Wire the canonical build pipeline: clean, then styles and templates
/// in parallel, then app-styles, then the lint/compile script chain,
/// then asset copying, capped by the `build` aggregate. The lint steps
/// guard their script units; the compile steps require them.
pub fn wire_build(
    registry: &mut Registry,
    layout: &ProjectLayout,
    tools: Toolchain,
) -> Result<BuildPipeline, RegistryError> {
    let clean = registry.register(TaskSpec::new("clean", clean_action(layout.clone())))?;
    let templates =
        registry.register(TaskSpec::from_arc("templates", tools.templates).group("static"))?;
    let styles = registry.register(TaskSpec::from_arc("styles", tools.styles).group("static"))?;
    let app_styles = registry.register(TaskSpec::from_arc("app-styles", tools.app_styles))?;
    let lint_scripts = registry
        .register(TaskSpec::from_arc("lint-scripts", tools.lint_scripts).guards("scripts"))?;
    let scripts = registry.register(
        TaskSpec::from_arc("scripts", tools.scripts)
            .after([lint_scripts])
            .requires("scripts"),
    )?;
    let lib_scripts = registry.register(TaskSpec::from_arc("lib-scripts", tools.lib_scripts))?;
    let lint_app_scripts = registry.register(
        TaskSpec::from_arc("lint-app-scripts", tools.lint_app_scripts).guards("app-scripts"),
    )?;
    let app_scripts = registry.register(
        TaskSpec::from_arc("app-scripts", tools.app_scripts)
            .after([lint_app_scripts])
            .requires("app-scripts"),
    )?;
    let copy_assets =
        registry.register(TaskSpec::new("copy-assets", copy_assets_action(layout.clone())))?;

    let build = Sequence::new(registry)
        .step(clean)?
        .group([templates, styles])?
        .step(app_styles)?
        .step(lint_scripts)?
        .step(scripts)?
        .step(lib_scripts)?
        .step(lint_app_scripts)?
        .step(app_scripts)?
        .step(copy_assets)?
        .finish("build", gate_on_run(DEPLOY_UNIT))?;

    Ok(BuildPipeline {
        build,
        clean,
        templates,
        styles,
        app_styles,
        lint_scripts,
        scripts,
        lib_scripts,
        lint_app_scripts,
        app_scripts,
        copy_assets,
    })
}

/// Handles to the deploy pipeline variants.
pub struct DeployPipeline {
    pub publish_pages: TaskId,
    pub publish_remote: TaskId,
    pub deploy: TaskId,
    pub deploy_remote: TaskId,
    pub deploy_full: TaskId,
}

impl DeployPipeline {
    /// Variant selection is a pure function of the run configuration,
    /// not part of the graph.
    pub fn select(&self, target: DeployTarget) -> TaskId {
        match target {
            DeployTarget::Pages => self.deploy,
            DeployTarget::Remote => self.deploy_remote,
            DeployTarget::Both => self.deploy_full,
        }
    }
}

/// Wire the deploy pipelines over an existing `build` aggregate. Both
/// publishers require the build to have finished cleanly; a failed
/// build suppresses publishing without aborting the run.
pub fn wire_deploy(
    registry: &mut Registry,
    build: TaskId,
    publish_pages: Arc<dyn Action>,
    publish_remote: Arc<dyn Action>,
) -> Result<DeployPipeline, RegistryError> {
    let pages = registry.register(
        TaskSpec::from_arc("publish-pages", publish_pages)
            .after([build])
            .requires(DEPLOY_UNIT),
    )?;
    let remote = registry.register(
        TaskSpec::from_arc("publish-remote", publish_remote)
            .after([build])
            .requires(DEPLOY_UNIT),
    )?;

    let deploy = registry.register(TaskSpec::new("deploy", noop).after([pages]))?;
    let deploy_remote = registry.register(TaskSpec::new("deploy-remote", noop).after([remote]))?;
    let deploy_full =
        registry.register(TaskSpec::new("deploy-full", noop).after([pages, remote]))?;

    Ok(DeployPipeline {
        publish_pages: pages,
        publish_remote: remote,
        deploy,
        deploy_remote,
        deploy_full,
    })
}

/// The standard watch table for the canonical layout: path globs mapped
/// to the tasks they trigger and the cache partitions they invalidate.
/// Partial and core directories re-run the aggregate steps; core style
/// changes additionally flush the per-file style cache.
#[cfg(feature = "live")]
pub fn standard_bindings(layout: &ProjectLayout, build: &BuildPipeline) -> Vec<WatchBinding> {
    vec![
        WatchBinding::new(
            "templates",
            [format!("{}/**/*.pug", layout.views)],
            [build.templates],
        ),
        WatchBinding::new(
            "template-partials",
            [format!("{}/_*/**/*.pug", layout.views)],
            [build.templates],
        )
        .invalidating("templates"),
        WatchBinding::new(
            "styles",
            [format!("{}/**/*.scss", layout.styles)],
            [build.styles],
        ),
        WatchBinding::new(
            "style-partials",
            [format!("{}/_partial/**/*.scss", layout.styles)],
            [build.app_styles],
        ),
        WatchBinding::new(
            "style-cores",
            [format!("{}/_cores/**/*.scss", layout.styles)],
            [build.styles, build.app_styles],
        )
        .invalidating("styles"),
        WatchBinding::new(
            "scripts",
            [format!("{}/**/*.jsx", layout.scripts)],
            [build.scripts],
        ),
        WatchBinding::new(
            "lib-scripts",
            [format!("{}/_lib/**/*.js", layout.scripts)],
            [build.lib_scripts],
        ),
        WatchBinding::new(
            "app-scripts",
            [format!("{}/_partial/**/*.jsx", layout.scripts)],
            [build.app_scripts],
        ),
        WatchBinding::new(
            "assets",
            [format!("{}/**/*", layout.assets)],
            [build.copy_assets],
        ),
    ]
}

fn noop(_: &TaskContext) -> ActionResult {
    Ok(Vec::new())
}

/// Close or reopen `unit` based on whether the run has failed so far.
/// Used by the `build` aggregate, which runs after every other step.
fn gate_on_run(unit: &'static str) -> impl Action {
    move |ctx: &TaskContext| -> ActionResult {
        ctx.gates.set(unit, !ctx.run_has_failures());
        Ok(Vec::new())
    }
}

/// Reset the fingerprint cache and clear the output directory.
pub fn clean_action(layout: ProjectLayout) -> impl Action {
    move |ctx: &TaskContext| -> ActionResult {
        ctx.cache.invalidate_all();
        crate::io::clear_dest(&layout.dest)?;
        Ok(Vec::new())
    }
}

/// Copy static assets into the output tree, skipping files whose
/// fingerprint is already cached under this task's partition.
pub fn copy_assets_action(layout: ProjectLayout) -> impl Action {
    move |ctx: &TaskContext| -> ActionResult {
        let mut outputs = Vec::new();

        for file in crate::io::walk_files(&layout.assets)? {
            let fingerprint = match Fingerprint::of_file(file.clone()) {
                Ok(fingerprint) => fingerprint,
                Err(err) => {
                    ctx.error_with(file.to_string(), err.to_string());
                    continue;
                }
            };
            if ctx.cache.has(ctx.source(), &fingerprint) {
                continue;
            }

            match crate::io::copy_into(&file, &layout.assets, &layout.dest) {
                Ok(target) => {
                    ctx.cache.remember(ctx.source(), fingerprint);
                    outputs.push(target);
                }
                Err(err) => ctx.error_with(file.to_string(), err.to_string()),
            }
        }

        Ok(outputs)
    }
}

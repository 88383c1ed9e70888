//! Watch mode is implemented as a three-part system:
//!
//! 1. **File watcher**: Uses the `notify` crate to monitor filesystem
//!    events recursively, with debouncing to prevent duplicate builds
//!    from rapid file saves.
//! 2. **Dispatcher + binding workers**: A dispatcher thread matches
//!    debounced event paths against each binding's glob set and forwards
//!    triggers to one worker thread per binding. Runs for the same
//!    binding are serialized — a trigger arriving while a run is in
//!    flight queues up and coalesces — while independent bindings
//!    rebuild concurrently.
//! 3. **WebSocket server**: A dedicated thread maintains persistent
//!    connections with open browser tabs. After a successful rebuild the
//!    worker pushes the changed output paths, and every client receives
//!    a JSON reload message naming them.
//!
//! A task error never tears watch mode down; the run's report is printed
//! and the worker waits for the next change event.

use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tungstenite::WebSocket;

use crate::Mode;
use crate::error::WatchError;
use crate::graph::Registry;
use crate::runner::{RunContext, run};
use crate::task::TaskId;

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Maps a set of path glob patterns to the tasks to invoke on a change
/// and, optionally, the cache partition to invalidate beforehand.
pub struct WatchBinding {
    pub(crate) name: Box<str>,
    pub(crate) globs: Vec<String>,
    pub(crate) tasks: Vec<TaskId>,
    pub(crate) partition: Option<Box<str>>,
}

impl WatchBinding {
    pub fn new(
        name: impl Into<Box<str>>,
        globs: impl IntoIterator<Item = impl Into<String>>,
        tasks: impl IntoIterator<Item = TaskId>,
    ) -> Self {
        Self {
            name: name.into(),
            globs: globs.into_iter().map(Into::into).collect(),
            tasks: tasks.into_iter().collect(),
            partition: None,
        }
    }

    /// Invalidate the named cache partition before every triggered run.
    pub fn invalidating(mut self, partition: impl Into<Box<str>>) -> Self {
        self.partition = Some(partition.into());
        self
    }
}

struct CompiledBinding {
    patterns: Vec<Pattern>,
    trigger: Sender<()>,
}

pub(crate) struct BindingRuntime {
    pub name: Box<str>,
    pub tasks: Vec<TaskId>,
    pub partition: Option<Box<str>>,
}

/// Cancellable handle to a running watch session. Dropping it without
/// calling [`stop`](WatchHandle::stop) detaches the worker threads; they
/// wind down once the watcher stops delivering events.
pub struct WatchHandle {
    port: u16,
    stop: Arc<AtomicBool>,
    debouncer: Option<Debouncer<notify::RecommendedWatcher, RecommendedCache>>,
    threads: Vec<JoinHandle<()>>,
}

impl WatchHandle {
    /// Port of the live reload websocket.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Tear the watch loop down: stop delivering filesystem events, let
    /// every in-flight run finish, and join the worker threads.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.debouncer.take();

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// Subscribe the given bindings to filesystem changes. Every binding is
/// fully established before the first event can be observed.
pub fn watch(
    registry: Arc<Registry>,
    ctx: Arc<RunContext>,
    bindings: Vec<WatchBinding>,
) -> Result<WatchHandle, WatchError> {
    let (tcp, port) = reserve_port()?;
    let clients = Arc::new(Mutex::new(vec![]));

    // The accept thread blocks on the listener and is deliberately
    // detached; it dies with the process.
    let _thread_i = new_thread_ws_incoming(tcp, clients.clone());
    let (tx_reload, thread_o) = new_thread_ws_reload(clients.clone());

    let mut threads = vec![thread_o];
    let mut compiled = Vec::new();
    let mut roots = HashSet::new();

    for binding in bindings {
        let mut patterns = Vec::new();
        for glob in &binding.globs {
            match resolve_watch_path(glob) {
                Ok((root, pattern)) => {
                    roots.insert(root);
                    patterns.push(pattern);
                }
                Err(_) => tracing::error!("failed to resolve path: {glob}"),
            }
        }

        let (trigger, rx) = channel();
        let runtime = BindingRuntime {
            name: binding.name,
            tasks: binding.tasks,
            partition: binding.partition,
        };
        threads.push(spawn_binding_worker(
            rx,
            registry.clone(),
            ctx.clone(),
            runtime,
            Some(tx_reload.clone()),
        ));
        compiled.push(CompiledBinding { patterns, trigger });
    }
    // Workers hold their own clones.
    drop(tx_reload);

    let (tx, rx) = channel();
    let mut debouncer = new_debouncer(DEBOUNCE, None, tx)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    threads.push(std::thread::spawn(move || dispatch(rx, compiled, stop_flag)));

    for root in collapse_watch_paths(roots) {
        tracing::info!("watching {root}");
        debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
    }

    Ok(WatchHandle {
        port,
        stop,
        debouncer: Some(debouncer),
        threads,
    })
}

fn dispatch(rx: Receiver<DebounceEventResult>, bindings: Vec<CompiledBinding>, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(events)) => {
                let paths: HashSet<PathBuf> = events
                    .iter()
                    .filter(|de| {
                        matches!(
                            de.event.kind,
                            EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                        )
                    })
                    .flat_map(|de| de.event.paths.iter().cloned())
                    .collect();

                if paths.is_empty() {
                    continue;
                }

                for binding in &bindings {
                    if binding_matches(&binding.patterns, &paths) {
                        // A full queue means a run is already pending.
                        let _ = binding.trigger.send(());
                    }
                }
            }
            Ok(Err(errors)) => {
                for error in errors {
                    tracing::error!("watch error: {error:?}");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn binding_matches(patterns: &[Pattern], paths: &HashSet<PathBuf>) -> bool {
    paths
        .iter()
        .any(|path| patterns.iter().any(|pattern| pattern.matches_path(path)))
}

/// One worker per binding: triggered runs for the same binding execute
/// strictly one after another, and triggers that arrive while a run is
/// in flight coalesce into a single follow-up run.
pub(crate) fn spawn_binding_worker(
    rx: Receiver<()>,
    registry: Arc<Registry>,
    ctx: Arc<RunContext>,
    binding: BindingRuntime,
    tx_reload: Option<Sender<Vec<Utf8PathBuf>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while rx.recv().is_ok() {
            while rx.try_recv().is_ok() {}

            if let Some(partition) = &binding.partition {
                ctx.cache.invalidate(partition);
            }

            match run(&registry, &binding.tasks, &ctx, Mode::Watch) {
                Ok(summary) if !summary.failed() => {
                    if let Some(tx) = &tx_reload {
                        let _ = tx.send(summary.outputs);
                    }
                }
                // Reported already; wait for the next change event.
                Ok(_) => {}
                Err(err) => {
                    tracing::error!("watch run for '{}' failed to resolve: {err}", binding.name)
                }
            }
        }
    })
}

fn reserve_port() -> Result<(TcpListener, u16), WatchError> {
    let listener = match TcpListener::bind("127.0.0.1:1337") {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0").map_err(WatchError::Bind)?,
    };

    let addr = listener.local_addr().map_err(WatchError::Bind)?;
    let port = addr.port();
    Ok((listener, port))
}

fn new_thread_ws_incoming(
    server: TcpListener,
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let Ok(stream) = stream else { continue };
            if let Ok(socket) = tungstenite::accept(stream) {
                client.lock().unwrap().push(socket);
            }
        }
    })
}

fn new_thread_ws_reload(
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> (Sender<Vec<Utf8PathBuf>>, JoinHandle<()>) {
    let (tx, rx) = channel::<Vec<Utf8PathBuf>>();

    let thread = std::thread::spawn(move || {
        while let Ok(paths) = rx.recv() {
            let message = reload_payload(&paths);
            let mut clients = client.lock().unwrap();
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send(message.clone().into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) => {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            broken.push(i);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Error: {e:?}");
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            // Close all but the last 10 connections
            let len = clients.len();
            if len > 10 {
                for mut socket in clients.drain(0..len - 10) {
                    socket.close(None).ok();
                }
            }
        }
    });

    (tx, thread)
}

/// Reload message naming the output paths changed by the last rebuild.
fn reload_payload(paths: &[Utf8PathBuf]) -> String {
    let paths: Vec<&str> = paths.iter().map(|p| p.as_str()).collect();
    serde_json::json!({ "kind": "reload", "paths": paths }).to_string()
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(glob_str: impl AsRef<str>) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let path = Utf8Path::new(glob_str.as_ref());

    // Split path into static root and dynamic suffix (containing wildcards)
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix_part: Utf8PathBuf = components.iter().skip(split_idx).collect();

    // Canonicalize the static root (must exist on disk)
    let absolute_root = root_part.canonicalize_utf8()?;

    // If the suffix is empty, we must check if the root is a file or
    // directory. If it's a file, we watch its parent to ensure atomic
    // writes are caught.
    let (watch_root, match_pattern_str) =
        if suffix_part.as_str().is_empty() && absolute_root.is_file() {
            // Case: Concrete File (e.g., "README.md") -> Watch Parent, Match File
            let parent = absolute_root
                .parent()
                .unwrap_or(&absolute_root)
                .to_path_buf();
            (parent, absolute_root)
        } else {
            // Case: Directory (e.g., "src/") or Wildcard (e.g., "src/**/*.rs")
            // -> Watch Dir, Match Pattern
            let pattern_str = absolute_root.join(&suffix_part);
            (absolute_root, pattern_str)
        };

    let pattern = Pattern::new(watch_root.join(match_pattern_str).as_str())?;

    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive. This function sorts the paths and filters
/// out any path that is a subdirectory of a previously accepted path.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::task::{ActionResult, TaskContext, TaskSpec};

    #[test]
    fn test_concrete_file() {
        // Input: "README.md" (concrete file)
        let (watch, pattern) = resolve_watch_path("README.md").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        // Expectation:
        // Watch: "$CWD/README.md"
        // Pattern: "$CWD/README.md"
        assert_eq!(watch.as_str(), cwd);
        assert_eq!(pattern.as_str(), cwd.join("README.md"));
    }

    #[test]
    fn test_concrete_directory() {
        // Input: "src" (concrete directory)
        let (watch, pattern) = resolve_watch_path("src").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        // Expectation:
        // Watch: "src" directory
        // Pattern: "src"
        assert_eq!(watch.as_str(), cwd.join("src"));
        assert_eq!(pattern.as_str(), cwd.join("src"));
    }

    #[test]
    fn test_directory_wildcard() {
        // Input: "src/**/*.rs"
        let (watch, pattern) = resolve_watch_path("src/**/*.rs").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        // Expectation:
        // Watch: "src" directory (the static part)
        // Pattern: "src/**/*.rs"
        assert_eq!(watch.as_str(), cwd.join("src/"));
        assert_eq!(pattern.as_str(), cwd.join("src/**/*.rs"));
    }

    #[test]
    fn test_collapse_watch_paths() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/a"));
        paths.insert(Utf8PathBuf::from("/a/b"));
        paths.insert(Utf8PathBuf::from("/a/b/c"));
        paths.insert(Utf8PathBuf::from("/b"));
        paths.insert(Utf8PathBuf::from("/c/d"));

        let collapsed = collapse_watch_paths(paths);

        // Expected: /a, /b, /c/d
        // /a/b and /a/b/c are covered by /a.
        assert_eq!(
            collapsed,
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/b"),
                Utf8PathBuf::from("/c/d")
            ]
        );
    }

    #[test]
    fn test_collapse_watch_paths_similar_names() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/foo"));
        paths.insert(Utf8PathBuf::from("/foo-bar"));

        let collapsed = collapse_watch_paths(paths);

        // Expected: /foo, /foo-bar
        // /foo-bar is not a subdirectory of /foo
        assert_eq!(
            collapsed,
            vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]
        );
    }

    #[test]
    fn binding_matching_is_glob_scoped() {
        let patterns = vec![Pattern::new("/project/app/styles/**/*.scss").unwrap()];

        let mut hit = HashSet::new();
        hit.insert(PathBuf::from("/project/app/styles/base/main.scss"));
        assert!(binding_matches(&patterns, &hit));

        let mut miss = HashSet::new();
        miss.insert(PathBuf::from("/project/app/scripts/app.jsx"));
        assert!(!binding_matches(&patterns, &miss));
    }

    #[test]
    fn reload_payload_names_changed_outputs() {
        let payload = reload_payload(&[Utf8PathBuf::from("public/css/main.css")]);
        assert!(payload.contains("reload"));
        assert!(payload.contains("public/css/main.css"));
    }

    #[test]
    fn triggered_runs_for_one_binding_are_serialized() {
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let flight = in_flight.clone();
        let overlap = overlapped.clone();
        let counter = runs.clone();
        let task = registry
            .register(TaskSpec::new("styles", move |_: &TaskContext| -> ActionResult {
                if flight.swap(true, Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(100));
                counter.fetch_add(1, Ordering::SeqCst);
                flight.store(false, Ordering::SeqCst);
                Ok(Vec::new())
            }))
            .unwrap();

        let registry = Arc::new(registry);
        let ctx = Arc::new(RunContext::default());
        let (tx, rx) = channel();
        let worker = spawn_binding_worker(
            rx,
            registry,
            ctx,
            BindingRuntime {
                name: "styles".into(),
                tasks: vec![task],
                partition: None,
            },
            None,
        );

        tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // These arrive while the first run is still in flight; they must
        // queue up and coalesce into one follow-up run.
        tx.send(()).unwrap();
        tx.send(()).unwrap();

        std::thread::sleep(Duration::from_millis(400));
        drop(tx);
        worker.join().unwrap();

        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn worker_invalidates_its_partition_before_running() {
        let observed = Arc::new(AtomicUsize::new(usize::MAX));

        let mut registry = Registry::new();
        let seen = observed.clone();
        let task = registry
            .register(TaskSpec::new("styles", move |ctx: &TaskContext| -> ActionResult {
                seen.store(ctx.cache.len("styles"), Ordering::SeqCst);
                Ok(Vec::new())
            }))
            .unwrap();

        let registry = Arc::new(registry);
        let ctx = Arc::new(RunContext::default());
        ctx.cache.remember(
            "styles",
            crate::Fingerprint::new("a.scss", crate::Hash32::hash(b"a")),
        );

        let (tx, rx) = channel();
        let worker = spawn_binding_worker(
            rx,
            registry,
            ctx,
            BindingRuntime {
                name: "style-cores".into(),
                tasks: vec![task],
                partition: Some("styles".into()),
            },
            None,
        );

        tx.send(()).unwrap();
        drop(tx);
        worker.join().unwrap();

        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_reports_failure_and_keeps_going() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let counter = attempts.clone();
        let task = registry
            .register(TaskSpec::new("sass", move |ctx: &TaskContext| -> ActionResult {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.error("app/styles/main.scss");
                Ok(Vec::new())
            }))
            .unwrap();

        let registry = Arc::new(registry);
        let ctx = Arc::new(RunContext::default());
        let (tx_reload, rx_reload) = channel();

        let (tx, rx) = channel();
        let worker = spawn_binding_worker(
            rx,
            registry,
            ctx,
            BindingRuntime {
                name: "styles".into(),
                tasks: vec![task],
                partition: None,
            },
            Some(tx_reload),
        );

        tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        // The worker survived the failed run and accepts new triggers.
        tx.send(()).unwrap();
        drop(tx);
        worker.join().unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // Failed runs never notify the live client.
        assert!(rx_reload.try_recv().is_err());
    }
}

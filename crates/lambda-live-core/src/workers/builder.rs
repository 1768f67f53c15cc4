use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lambda_live_proto::{BuildFailed, Event, EventKind, FunctionRef};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::{BuildArtifact, BuildInput, BuildOutput, RuntimeHandlers, ShouldBuildInput};
use crate::bus::EventBus;
use crate::config::{Config, FunctionConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Build failed for {function_id}: {}", errors.join("; "))]
pub struct BuildFailure {
    pub function_id: String,
    pub errors: Vec<String>,
}

impl BuildFailure {
    fn new(function_id: &str, error: impl Into<String>) -> Self {
        Self {
            function_id: function_id.to_string(),
            errors: vec![error.into()],
        }
    }
}

type BuildResult = Result<Arc<BuildArtifact>, BuildFailure>;
type PendingBuild = Shared<BoxFuture<'static, BuildResult>>;

#[derive(Default)]
struct BuilderState {
    artifacts: HashMap<String, Arc<BuildArtifact>>,
    pending: HashMap<String, PendingBuild>,
}

struct BuilderInner {
    bus: EventBus,
    handlers: RuntimeHandlers,
    functions: Arc<BTreeMap<String, FunctionConfig>>,
    root: PathBuf,
    artifacts_dir: PathBuf,
    permits: Semaphore,
    state: Mutex<BuilderState>,
}

/// Owns the current artifact of every function.
///
/// At most `concurrency` builds run at once. Asking for a build of a function
/// that is already being built joins the running build. A failed build leaves
/// the previous artifact in place.
#[derive(Clone)]
pub struct Builder {
    inner: Arc<BuilderInner>,
}

impl Builder {
    pub fn new(
        bus: EventBus,
        handlers: RuntimeHandlers,
        functions: Arc<BTreeMap<String, FunctionConfig>>,
        root: PathBuf,
        artifacts_dir: PathBuf,
        concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(BuilderInner {
                bus,
                handlers,
                functions,
                root,
                artifacts_dir,
                permits: Semaphore::new(concurrency.max(1)),
                state: Mutex::new(BuilderState::default()),
            }),
        }
    }

    pub fn from_config(config: &Config, bus: EventBus, handlers: RuntimeHandlers) -> Self {
        Self::new(
            bus,
            handlers,
            Arc::new(config.functions.clone()),
            config.root.clone(),
            config.artifacts_dir(),
            config.build.concurrency,
        )
    }

    pub fn cached(&self, function_id: &str) -> Option<Arc<BuildArtifact>> {
        self.inner.state().artifacts.get(function_id).cloned()
    }

    /// Returns the current artifact, building it first if there is none.
    pub async fn artifact(&self, function_id: &str) -> BuildResult {
        if let Some(artifact) = self.cached(function_id) {
            return Ok(artifact);
        }
        self.build(function_id).await
    }

    pub async fn build(&self, function_id: &str) -> BuildResult {
        let pending = {
            let mut state = self.inner.state();
            match state.pending.get(function_id) {
                Some(pending) => {
                    debug!(function_id, "Waiting on pending build");
                    pending.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let id = function_id.to_string();
                    let pending = async move { inner.run(id).await }.boxed().shared();
                    state.pending.insert(function_id.to_string(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Functions with an artifact that a change to `file` makes stale.
    pub fn stale_functions(&self, file: &Path) -> Vec<String> {
        let built: Vec<String> = self.inner.state().artifacts.keys().cloned().collect();
        built
            .into_iter()
            .filter(|function_id| {
                let Some(function) = self.inner.functions.get(function_id) else {
                    return false;
                };
                self.inner
                    .handlers
                    .for_runtime(&function.runtime)
                    .is_ok_and(|handler| {
                        handler.should_build(&ShouldBuildInput {
                            function_id,
                            file,
                        })
                    })
            })
            .collect()
    }

    /// Rebuilds affected functions whenever a `file.changed` event is
    /// published.
    pub fn watch_changes(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut changes = self.inner.bus.subscribe_channel(&[EventKind::FileChanged]);
        let builder = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = changes.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Event::FileChanged(changed) = event else {
                    continue;
                };
                for function_id in builder.stale_functions(&changed.file) {
                    let builder = builder.clone();
                    let file = changed.relative.clone();
                    tokio::spawn(async move {
                        info!(function_id = %function_id, file = %file.display(), "Rebuilding");
                        if let Err(e) = builder.build(&function_id).await {
                            warn!(function_id = %function_id, error = %e, "Rebuild failed");
                        }
                    });
                }
            }
        })
    }
}

impl BuilderInner {
    fn state(&self) -> MutexGuard<'_, BuilderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, function_id: String) -> BuildResult {
        let result = self.build_once(&function_id).await;

        let replaced = {
            let mut state = self.state();
            state.pending.remove(&function_id);
            match &result {
                Ok(artifact) => state.artifacts.insert(function_id.clone(), artifact.clone()),
                Err(_) => None,
            }
        };

        match &result {
            Ok(_) => {
                info!(function_id = %function_id, "Build succeeded");
                self.bus.publish(&Event::BuildSucceeded(FunctionRef {
                    function_id: function_id.clone(),
                }));
            }
            Err(failure) => {
                warn!(function_id = %function_id, errors = ?failure.errors, "Build failed");
                self.bus.publish(&Event::BuildFailed(BuildFailed {
                    function_id: function_id.clone(),
                    errors: failure.errors.clone(),
                }));
            }
        }
        if let Some(previous) = replaced {
            remove_output(&previous.out).await;
        }
        result
    }

    async fn build_once(&self, function_id: &str) -> BuildResult {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BuildFailure::new(function_id, "Build queue closed"))?;

        let function = self.functions.get(function_id).ok_or_else(|| {
            BuildFailure::new(function_id, format!("Function with ID \"{function_id}\" not found"))
        })?;
        let handler = self
            .handlers
            .for_runtime(&function.runtime)
            .map_err(|e| BuildFailure::new(function_id, e.to_string()))?;

        // Each build gets its own directory; the cached artifact stays intact
        // until a newer build replaces it.
        let out = self
            .artifacts_dir
            .join(function_id)
            .join(uuid::Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&out).await.map_err(|e| {
            BuildFailure::new(function_id, format!("Failed to create {}: {e}", out.display()))
        })?;

        self.bus.publish(&Event::BuildStarted(FunctionRef {
            function_id: function_id.to_string(),
        }));
        debug!(function_id, out = %out.display(), "Building function");

        let output = handler
            .build(BuildInput {
                function_id: function_id.to_string(),
                function: function.clone(),
                out: out.clone(),
                root: self.root.clone(),
            })
            .await;

        match output {
            BuildOutput::Success { handler, sourcemap } => Ok(Arc::new(BuildArtifact {
                out,
                handler,
                sourcemap,
            })),
            BuildOutput::Error { errors } => {
                remove_output(&out).await;
                Err(BuildFailure {
                    function_id: function_id.to_string(),
                    errors,
                })
            }
        }
    }
}

async fn remove_output(out: &Path) {
    match tokio::fs::remove_dir_all(out).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(out = %out.display(), error = %e, "Failed to remove build output"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use lambda_live_proto::FileChanged;
    use tokio::sync::mpsc;

    use super::*;
    use crate::workers::handler::{RuntimeHandler, StartWorkerInput, WorkerEvent};
    use crate::workers::WorkerError;

    /// Records build concurrency; fails builds of functions named `broken*`.
    #[derive(Default)]
    struct FakeHandler {
        running: AtomicUsize,
        peak: AtomicUsize,
        builds: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RuntimeHandler for FakeHandler {
        fn can_handle(&self, runtime: &str) -> bool {
            runtime == "fake"
        }

        async fn build(&self, input: BuildInput) -> BuildOutput {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) || input.function_id.starts_with("broken") {
                BuildOutput::Error {
                    errors: vec!["syntax error".into()],
                }
            } else {
                tokio::fs::write(input.out.join("bootstrap"), b"binary").await.unwrap();
                BuildOutput::Success {
                    handler: "bootstrap".into(),
                    sourcemap: None,
                }
            }
        }

        async fn start_worker(
            &self,
            _input: StartWorkerInput,
            _events: mpsc::UnboundedSender<WorkerEvent>,
        ) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn stop_worker(&self, _worker_id: &str) {}

        fn should_build(&self, input: &ShouldBuildInput<'_>) -> bool {
            input.file.starts_with("/src")
        }
    }

    fn builder_with(
        handler: Arc<FakeHandler>,
        ids: &[&str],
        concurrency: usize,
    ) -> (Builder, EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new("test");
        let mut handlers = RuntimeHandlers::new();
        handlers.register(handler);
        let functions = ids
            .iter()
            .map(|id| {
                (
                    (*id).to_string(),
                    FunctionConfig {
                        runtime: "fake".into(),
                        handler: "main.go".into(),
                        build: None,
                        environment: Default::default(),
                    },
                )
            })
            .collect();
        let builder = Builder::new(
            bus.clone(),
            handlers,
            Arc::new(functions),
            dir.path().to_path_buf(),
            dir.path().join("artifacts"),
            concurrency,
        );
        (builder, bus, dir)
    }

    #[tokio::test]
    async fn concurrent_builds_are_capped() {
        let handler = Arc::new(FakeHandler::default());
        let ids: Vec<String> = (0..10).map(|i| format!("fn{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (builder, _bus, _dir) = builder_with(handler.clone(), &id_refs, 4);

        let builds = ids.iter().map(|id| {
            let builder = builder.clone();
            let id = id.clone();
            async move { builder.build(&id).await }
        });
        let results = futures::future::join_all(builds).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(handler.builds.load(Ordering::SeqCst), 10);
        assert!(handler.peak.load(Ordering::SeqCst) <= 4);
        assert!(handler.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn pending_build_is_shared() {
        let handler = Arc::new(FakeHandler::default());
        let (builder, bus, _dir) = builder_with(handler.clone(), &["api"], 4);
        let mut started = bus.subscribe_channel(&[EventKind::BuildStarted]);

        let (a, b) = tokio::join!(builder.build("api"), builder.artifact("api"));

        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(handler.builds.load(Ordering::SeqCst), 1);
        assert!(started.try_recv().is_some());
        assert!(started.try_recv().is_none());
    }

    #[tokio::test]
    async fn cached_artifact_skips_the_build() {
        let handler = Arc::new(FakeHandler::default());
        let (builder, _bus, _dir) = builder_with(handler.clone(), &["api"], 4);

        let first = builder.artifact("api").await.unwrap();
        let second = builder.artifact("api").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(handler.builds.load(Ordering::SeqCst), 1);
        assert!(first.out.parent().unwrap().ends_with("artifacts/api"));
        assert!(first.out.join("bootstrap").is_file());
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_the_previous_artifact() {
        let handler = Arc::new(FakeHandler::default());
        let (builder, bus, _dir) = builder_with(handler.clone(), &["api"], 4);
        let mut outcomes =
            bus.subscribe_channel(&[EventKind::BuildSucceeded, EventKind::BuildFailed]);

        let first = builder.build("api").await.unwrap();
        handler.fail.store(true, Ordering::SeqCst);
        let err = builder.build("api").await.unwrap_err();

        assert_eq!(err.errors, vec!["syntax error".to_string()]);
        assert!(Arc::ptr_eq(&builder.cached("api").unwrap(), &first));
        assert_eq!(outcomes.recv().await.map(|e| e.kind()), Some(EventKind::BuildSucceeded));
        assert_eq!(outcomes.recv().await.map(|e| e.kind()), Some(EventKind::BuildFailed));
    }

    #[tokio::test]
    async fn failed_rebuild_leaves_the_previous_output_on_disk() {
        let handler = Arc::new(FakeHandler::default());
        let (builder, _bus, dir) = builder_with(handler.clone(), &["api"], 4);
        let outputs = || std::fs::read_dir(dir.path().join("artifacts/api")).unwrap().count();

        let first = builder.build("api").await.unwrap();
        handler.fail.store(true, Ordering::SeqCst);
        builder.build("api").await.unwrap_err();

        let cached = builder.cached("api").unwrap();
        assert_eq!(cached.out, first.out);
        assert!(cached.out.join("bootstrap").is_file());
        assert_eq!(outputs(), 1);

        // A successful rebuild swaps in a new directory and removes the old one.
        handler.fail.store(false, Ordering::SeqCst);
        let second = builder.build("api").await.unwrap();
        assert_ne!(second.out, first.out);
        assert!(second.out.join("bootstrap").is_file());
        assert!(!first.out.exists());
        assert_eq!(outputs(), 1);
    }

    #[tokio::test]
    async fn unknown_function_fails_without_building() {
        let handler = Arc::new(FakeHandler::default());
        let (builder, _bus, _dir) = builder_with(handler.clone(), &["api"], 4);

        let err = builder.artifact("missing").await.unwrap_err();

        assert!(err.errors[0].contains("not found"));
        assert_eq!(handler.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn file_changes_rebuild_only_built_functions() {
        let handler = Arc::new(FakeHandler::default());
        let (builder, bus, _dir) = builder_with(handler.clone(), &["api", "worker"], 4);
        builder.artifact("api").await.unwrap();
        let cancel = CancellationToken::new();
        let _task = builder.watch_changes(cancel.clone());
        let mut succeeded = bus.subscribe_channel(&[EventKind::BuildSucceeded]);

        bus.publish(&Event::FileChanged(FileChanged {
            file: PathBuf::from("/src/main.go"),
            relative: PathBuf::from("main.go"),
        }));

        let event = tokio::time::timeout(Duration::from_secs(5), succeeded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Event::BuildSucceeded(FunctionRef {
                function_id: "api".into()
            })
        );
        assert_eq!(handler.builds.load(Ordering::SeqCst), 2);
        assert!(builder.stale_functions(Path::new("/elsewhere/x.go")).is_empty());
        cancel.cancel();
    }
}

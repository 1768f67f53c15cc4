use std::path::{Component, Path, PathBuf};

use lambda_live_proto::{Event, FileChanged};
use notify::{
    EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;

const IGNORED_DIRS: [&str; 6] = [
    "node_modules",
    ".build",
    ".sst",
    ".git",
    ".serverless",
    "vendor",
];

const IGNORED_FILES: [&str; 1] = ["debug.log"];

/// Publishes `file.changed` for edits under the service directory.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    pub fn start(
        root: &Path,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Result<Self, notify::Error> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        debug!(root = %root.display(), "Watching for changes");

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if !matches!(event.kind, FsEventKind::Create(_) | FsEventKind::Modify(_)) {
                    continue;
                }
                for file in event.paths {
                    if let Some(changed) = changed_file(&root, file) {
                        debug!(file = %changed.relative.display(), "File changed");
                        bus.publish(&Event::FileChanged(changed));
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

fn changed_file(root: &Path, file: PathBuf) -> Option<FileChanged> {
    let relative = file.strip_prefix(root).ok()?.to_path_buf();
    if relative.as_os_str().is_empty() || is_ignored(&relative) {
        return None;
    }
    Some(FileChanged { file, relative })
}

fn is_ignored(relative: &Path) -> bool {
    let ignored_dir = relative.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name)),
        _ => false,
    });
    ignored_dir
        || relative
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| IGNORED_FILES.contains(&name))
}

//! Handler for compiled runtimes (`go*`, `provided*`): the artifact is a
//! `bootstrap` executable that speaks the runtime API itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WorkerError;
use super::handler::{
    BuildInput, BuildOutput, RuntimeHandler, ShouldBuildInput, StartWorkerInput, WorkerEvent,
};

#[cfg(windows)]
const BOOTSTRAP: &str = "bootstrap.exe";
#[cfg(not(windows))]
const BOOTSTRAP: &str = "bootstrap";

struct RunningProcess {
    instance: u64,
    kill: CancellationToken,
}

type Processes = Arc<Mutex<HashMap<String, RunningProcess>>>;

#[derive(Default)]
pub struct ProcessHandler {
    processes: Processes,
    /// Project root (the directory holding `go.mod`) of each built function.
    sources: Mutex<HashMap<String, PathBuf>>,
}

impl ProcessHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<String, RunningProcess>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RuntimeHandler for ProcessHandler {
    fn can_handle(&self, runtime: &str) -> bool {
        runtime.starts_with("go") || runtime.starts_with("provided")
    }

    async fn build(&self, input: BuildInput) -> BuildOutput {
        let handler_path = input.root.join(&input.function.handler);
        let search_from = handler_path.parent().unwrap_or(input.root.as_path());
        let Some(project) = find_above(search_from, "go.mod") else {
            return BuildOutput::Error {
                errors: vec![format!(
                    "go.mod not found above {}",
                    search_from.display()
                )],
            };
        };
        self.sources()
            .insert(input.function_id.clone(), project.clone());

        let source = handler_path
            .strip_prefix(&project)
            .unwrap_or(&handler_path)
            .to_path_buf();
        let target = input.out.join(BOOTSTRAP);
        let command = build_command(input.function.build.as_deref(), &target, &source);
        debug!(function_id = %input.function_id, command = %command, cwd = %project.display(), "Running build");

        match shell(&command).current_dir(&project).output().await {
            Ok(output) if output.status.success() => BuildOutput::Success {
                handler: BOOTSTRAP.to_string(),
                sourcemap: None,
            },
            Ok(output) => {
                let mut errors: Vec<String> = String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .chain(String::from_utf8_lossy(&output.stdout).lines())
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                if errors.is_empty() {
                    errors.push(format!("Build command exited with {}", output.status));
                }
                BuildOutput::Error { errors }
            }
            Err(e) => BuildOutput::Error {
                errors: vec![format!("Failed to run build command: {e}")],
            },
        }
    }

    async fn start_worker(
        &self,
        input: StartWorkerInput,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<(), WorkerError> {
        let executable = input.artifact.out.join(&input.artifact.handler);
        let mut child = Command::new(&executable)
            .current_dir(&input.artifact.out)
            .envs(&input.environment)
            .env("IS_LOCAL", "true")
            .env("AWS_LAMBDA_RUNTIME_API", &input.runtime_api)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                worker_id: input.worker_id.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, input.clone(), events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, input.clone(), events.clone()));
        }

        let kill = CancellationToken::new();
        let replaced = self.processes().insert(
            input.worker_id.clone(),
            RunningProcess {
                instance: input.instance,
                kill: kill.clone(),
            },
        );
        if let Some(previous) = replaced {
            warn!(worker_id = %input.worker_id, "Replacing a running worker process");
            previous.kill.cancel();
        }

        info!(worker_id = %input.worker_id, function_id = %input.function_id, pid = ?child.id(), "Worker process started");

        let processes = self.processes.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                () = kill.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!(worker_id = %input.worker_id, error = %e, "Kill failed");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(worker_id = %input.worker_id, error = %e, "Failed to wait for worker process");
                    None
                }
            };

            {
                let mut processes = processes.lock().unwrap_or_else(PoisonError::into_inner);
                if processes
                    .get(&input.worker_id)
                    .is_some_and(|p| p.instance == input.instance)
                {
                    processes.remove(&input.worker_id);
                }
            }
            let _ = events.send(WorkerEvent::Exited {
                worker_id: input.worker_id,
                instance: input.instance,
                code,
            });
        });

        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) {
        if let Some(process) = self.processes().remove(worker_id) {
            debug!(worker_id, "Stopping worker process");
            process.kill.cancel();
        }
    }

    fn should_build(&self, input: &ShouldBuildInput<'_>) -> bool {
        self.sources()
            .get(input.function_id)
            .is_some_and(|project| input.file.starts_with(project))
    }
}

async fn forward_lines<R>(
    reader: R,
    input: StartWorkerInput,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let event = WorkerEvent::Output {
                    worker_id: input.worker_id.clone(),
                    function_id: input.function_id.clone(),
                    line,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(worker_id = %input.worker_id, error = %e, "Stopped reading worker output");
                return;
            }
        }
    }
}

/// Walks up from `start` looking for a directory containing `name`.
pub fn find_above(start: &Path, name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(name).exists())
        .map(Path::to_path_buf)
}

/// The shell command that compiles `source` into `target`.
///
/// A custom command keeps its own flags but never cross-compiles: any
/// `GOOS=`/`GOARCH=` assignment is removed so the binary runs locally.
pub fn build_command(custom: Option<&str>, target: &Path, source: &Path) -> String {
    let source = source.to_string_lossy().replace('\\', "/");
    let base = match custom {
        Some(cmd) => match Regex::new(r"(?i)GOOS=\S+|GOARCH=\S+") {
            Ok(re) => re.replace_all(cmd, "").trim().to_string(),
            Err(_) => cmd.trim().to_string(),
        },
        None => "go build -ldflags \"-s -w\"".to_string(),
    };
    format!("{base} -o \"{}\" ./{source}", target.display())
}

fn shell(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::FunctionConfig;
    use crate::workers::BuildArtifact;

    #[test]
    fn handles_compiled_runtimes_only() {
        let handler = ProcessHandler::new();
        assert!(handler.can_handle("go1.x"));
        assert!(handler.can_handle("provided.al2"));
        assert!(!handler.can_handle("nodejs18.x"));
    }

    #[test]
    fn default_command_strips_symbols() {
        let cmd = build_command(None, Path::new("/out/bootstrap"), Path::new("cmd/api"));
        assert_eq!(cmd, "go build -ldflags \"-s -w\" -o \"/out/bootstrap\" ./cmd/api");
    }

    #[test]
    fn custom_command_drops_cross_compilation() {
        let cmd = build_command(
            Some("GOOS=linux goarch=arm64 go build -tags lambda"),
            Path::new("/out/bootstrap"),
            Path::new("main.go"),
        );
        assert_eq!(cmd, "go build -tags lambda -o \"/out/bootstrap\" ./main.go");
    }

    #[test]
    fn find_above_walks_to_the_module_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("cmd/api");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();

        assert_eq!(find_above(&nested, "go.mod"), Some(dir.path().to_path_buf()));
        assert_eq!(find_above(&nested, "nope.mod"), None);
    }

    #[tokio::test]
    async fn build_without_go_mod_fails_and_nothing_is_watched() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ProcessHandler::new();
        let output = handler
            .build(BuildInput {
                function_id: "api".into(),
                function: FunctionConfig {
                    runtime: "go1.x".into(),
                    handler: "main.go".into(),
                    build: None,
                    environment: Default::default(),
                },
                out: dir.path().join("out"),
                root: dir.path().to_path_buf(),
            })
            .await;

        assert!(matches!(output, BuildOutput::Error { .. }));
        assert!(!handler.should_build(&ShouldBuildInput {
            function_id: "api",
            file: &dir.path().join("main.go"),
        }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn custom_build_marks_sources_for_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let handler = ProcessHandler::new();
        let output = handler
            .build(BuildInput {
                function_id: "api".into(),
                function: FunctionConfig {
                    runtime: "provided.al2".into(),
                    handler: "main.go".into(),
                    build: Some("true".into()),
                    environment: Default::default(),
                },
                out,
                root: dir.path().to_path_buf(),
            })
            .await;

        assert_eq!(
            output,
            BuildOutput::Success {
                handler: "bootstrap".into(),
                sourcemap: None
            }
        );
        assert!(handler.should_build(&ShouldBuildInput {
            function_id: "api",
            file: &dir.path().join("internal/db.go"),
        }));
        assert!(!handler.should_build(&ShouldBuildInput {
            function_id: "api",
            file: Path::new("/elsewhere/db.go"),
        }));
    }

    #[cfg(unix)]
    fn write_bootstrap(dir: &Path, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("bootstrap");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    fn start_input(out: &Path, instance: u64) -> StartWorkerInput {
        StartWorkerInput {
            worker_id: "w1".into(),
            function_id: "api".into(),
            instance,
            runtime: "go1.x".into(),
            artifact: Arc::new(BuildArtifact {
                out: out.to_path_buf(),
                handler: "bootstrap".into(),
                sourcemap: None,
            }),
            environment: HashMap::from([("GREETING".to_string(), "hi".to_string())]),
            runtime_api: "127.0.0.1:12557/w1".into(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_output_and_exit_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_bootstrap(
            dir.path(),
            "#!/bin/sh\necho \"$GREETING $AWS_LAMBDA_RUNTIME_API $IS_LOCAL\"\nexit 3\n",
        );
        let handler = ProcessHandler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        handler
            .start_worker(start_input(dir.path(), 1), tx)
            .await
            .unwrap();

        let mut lines = Vec::new();
        let exit = loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                WorkerEvent::Output { line, .. } => lines.push(line),
                exited @ WorkerEvent::Exited { .. } => break exited,
            }
        };

        assert_eq!(
            exit,
            WorkerEvent::Exited {
                worker_id: "w1".into(),
                instance: 1,
                code: Some(3)
            }
        );
        // Output readers may trail the exit notification.
        while let Ok(Some(WorkerEvent::Output { line, .. })) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            lines.push(line);
        }
        assert_eq!(lines, vec!["hi 127.0.0.1:12557/w1 true"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_worker_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        write_bootstrap(dir.path(), "#!/bin/sh\nexec sleep 30\n");
        let handler = ProcessHandler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        handler
            .start_worker(start_input(dir.path(), 7), tx)
            .await
            .unwrap();
        handler.stop_worker("w1").await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WorkerEvent::Exited { instance: 7, .. }));
    }
}

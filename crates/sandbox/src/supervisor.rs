//! Sandbox supervisor
//!
//! One execution is: validate, take a slot, create a working directory, write
//! the runner, launch under the isolation backend, watch the deadline and the
//! memory ceiling, collect output and artifacts, clean up. Every resource
//! taken along the way is held by a guard, so an early return or a dropped
//! future releases it too.

use geoforge_common::{config::SandboxConfig, errors::AppError, metrics, Result};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::isolation::{find_executable_in_path, readonly_mounts, IsolationBackend, LaunchSpec};
use crate::monitor;
use crate::policy::{ExecutionStatus, ResourceLimits, SandboxPolicy, SandboxRequest, SandboxResult, WorkdirPolicy};
use crate::registry::{ExecutionRegistry, RegistryGuard};
use crate::runner::{self, RESOURCE_EXIT_CODE};
use crate::validate::validate;

const WORKDIR_PREFIX: &str = "geoforge-exec-";
const MAX_ARTIFACTS: usize = 256;
const MAX_ARTIFACT_DEPTH: usize = 8;

/// Why the supervisor killed an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Breach {
    Timeout,
    Memory { rss_bytes: u64 },
}

pub struct SandboxSupervisor {
    policy: SandboxPolicy,
    backend: IsolationBackend,
    python: String,
    ro_binds: Vec<PathBuf>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    queue_timeout: Duration,
    monitor_interval: Duration,
    kill_grace: Duration,
    registry: Arc<ExecutionRegistry>,
}

impl SandboxSupervisor {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let backend = IsolationBackend::resolve(config)?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: &SandboxConfig, backend: IsolationBackend) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let python = resolve_interpreter(&config.python_path);
        let ro_binds = readonly_mounts(&python, &config.extra_ro_binds);
        tracing::info!(
            backend = backend.name(),
            python = %python,
            max_concurrent,
            "Sandbox supervisor ready"
        );
        Self {
            policy: SandboxPolicy::from(config),
            backend,
            python,
            ro_binds,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queue_timeout: Duration::from_secs(config.queue_timeout_secs),
            monitor_interval: Duration::from_millis(config.monitor_interval_ms.max(10)),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            registry: Arc::new(ExecutionRegistry::new()),
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &IsolationBackend {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run one request to completion.
    ///
    /// Limit breaches come back as result data; only request errors
    /// (oversized code), exhausted capacity and host failures are errors.
    pub async fn execute(&self, request: SandboxRequest) -> Result<SandboxResult> {
        let execution_id = Uuid::now_v7();

        let findings = validate(&request.code, self.policy.max_code_bytes)?;
        if !findings.is_empty() {
            tracing::info!(%execution_id, findings = findings.len(), "Sandbox code rejected");
            metrics::record_sandbox(0.0, ExecutionStatus::ValidationError.as_str());
            return Ok(SandboxResult::rejected(execution_id, findings));
        }

        let _permit = match tokio::time::timeout(self.queue_timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(AppError::Internal {
                    message: "sandbox slots closed".to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(%execution_id, max_concurrent = self.max_concurrent, "Sandbox capacity exhausted");
                return Err(AppError::ServiceUnavailable {
                    message: format!("all {} sandbox slots are busy", self.max_concurrent),
                });
            }
        };

        let timeout_ms = request.limits.timeout.as_millis() as u64;
        let registration = self.registry.register(execution_id, timeout_ms);
        let started = Instant::now();
        let workdir = create_workdir(&request.workdir)?;

        let outcome = self
            .run(&request, workdir.path(), &registration)
            .await
            .inspect_err(|e| tracing::error!(%execution_id, error = %e, "Sandbox execution failed to run"))?;

        let artifacts = collect_artifacts(
            workdir.path().to_path_buf(),
            request.workdir.keep_artifacts_in.clone(),
            execution_id,
        )
        .await;

        if let Err(e) = workdir.close() {
            tracing::warn!(%execution_id, error = %e, "Failed to remove sandbox working directory");
        }

        let elapsed = started.elapsed();
        let (status, exit_code) = classify(outcome.code, outcome.signal, outcome.breach);
        let mut stderr = render_output(outcome.stderr, outcome.stderr_truncated, self.policy.max_output_bytes);
        if let Some(breach) = outcome.breach {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&describe_breach(breach, &request.limits));
        }

        metrics::record_sandbox(elapsed.as_secs_f64(), status.as_str());
        tracing::info!(
            %execution_id,
            status = status.as_str(),
            exit_code = ?exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            artifacts = artifacts.len(),
            "Sandbox execution finished"
        );

        Ok(SandboxResult {
            execution_id,
            status,
            stdout: render_output(outcome.stdout, outcome.stdout_truncated, self.policy.max_output_bytes),
            stderr,
            stdout_truncated: outcome.stdout_truncated,
            stderr_truncated: outcome.stderr_truncated,
            artifacts,
            elapsed_ms: elapsed.as_millis() as u64,
            exit_code,
            findings: Vec::new(),
        })
    }

    async fn run(&self, request: &SandboxRequest, dir: &Path, registration: &RegistryGuard) -> Result<Outcome> {
        let runner_path = runner::prepare(dir, &request.code)
            .await
            .map_err(|e| internal("failed to write sandbox runner", e))?;

        let spec = LaunchSpec {
            python: &self.python,
            runner: &runner_path,
            workdir: dir,
            env: runner::environment(&request.limits, dir),
            allow_network: request.limits.allow_network,
            ro_binds: &self.ro_binds,
        };
        let mut child = self
            .backend
            .command(&spec)
            .spawn()
            .map_err(|e| internal("failed to start sandbox interpreter", e))?;

        let pid = child.id();
        let tree = TreeGuard(pid);
        if let Some(pid) = pid {
            registration.set_pid(pid);
        }

        let cap = self.policy.max_output_bytes;
        let stdout = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), cap));

        let (status, breach) = self.supervise(&mut child, pid, &request.limits).await?;
        drop(tree);

        let (stdout, stdout_truncated) = self.join_output(stdout).await;
        let (stderr, stderr_truncated) = self.join_output(stderr).await;

        Ok(Outcome {
            code: status.and_then(|s| s.code()),
            signal: status.as_ref().and_then(monitor::termination_signal),
            breach,
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
        })
    }

    /// Wait for the child while enforcing the deadline and the memory ceiling
    async fn supervise(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        limits: &ResourceLimits,
    ) -> Result<(Option<ExitStatus>, Option<Breach>)> {
        let deadline = tokio::time::Instant::now() + limits.timeout;
        let mut ticker = tokio::time::interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let breach = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| internal("failed to wait for sandbox process", e))?;
                    return Ok((Some(status), None));
                }
                _ = tokio::time::sleep_until(deadline) => break Breach::Timeout,
                _ = ticker.tick() => {
                    if let Some(rss_bytes) = pid.and_then(monitor::tree_rss_bytes) {
                        if rss_bytes > limits.memory_bytes() {
                            break Breach::Memory { rss_bytes };
                        }
                    }
                }
            }
        };

        tracing::debug!(?breach, pid = ?pid, "Killing sandbox process tree");
        if let Some(pid) = pid {
            monitor::kill_tree(pid);
        }
        let _ = child.start_kill();
        let status = match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(status) => Some(status.map_err(|e| internal("failed to reap sandbox process", e))?),
            Err(_) => {
                tracing::error!(pid = ?pid, "Sandbox process did not exit after kill");
                None
            }
        };
        Ok((status, Some(breach)))
    }

    async fn join_output(&self, task: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
        let abort = task.abort_handle();
        match tokio::time::timeout(self.kill_grace, task).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Sandbox output reader failed");
                (Vec::new(), false)
            }
            Err(_) => {
                // A straggler still holds the pipe open
                abort.abort();
                tracing::warn!("Sandbox output did not close after exit");
                (Vec::new(), true)
            }
        }
    }
}

struct Outcome {
    code: Option<i32>,
    signal: Option<i32>,
    breach: Option<Breach>,
    stdout: Vec<u8>,
    stdout_truncated: bool,
    stderr: Vec<u8>,
    stderr_truncated: bool,
}

/// Kills whatever is left of the process tree if the execution is abandoned
struct TreeGuard(Option<u32>);

impl Drop for TreeGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            monitor::kill_tree(pid);
        }
    }
}

fn internal(context: &str, error: std::io::Error) -> AppError {
    AppError::Internal {
        message: format!("{context}: {error}"),
    }
}

/// Absolute interpreter path, so launching does not depend on the child's PATH
fn resolve_interpreter(configured: &str) -> String {
    if configured.contains('/') {
        return configured.to_string();
    }
    match find_executable_in_path(configured) {
        Some(path) => path.to_string_lossy().to_string(),
        None => {
            tracing::warn!(python = configured, "Python interpreter not found in PATH");
            configured.to_string()
        }
    }
}

fn create_workdir(policy: &WorkdirPolicy) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(WORKDIR_PREFIX);
    let dir = match &policy.root {
        Some(root) => {
            std::fs::create_dir_all(root).map_err(|e| internal("failed to create sandbox work root", e))?;
            let root = std::fs::canonicalize(root).map_err(|e| internal("failed to resolve sandbox work root", e))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    };
    dir.map_err(|e| internal("failed to create sandbox working directory", e))
}

/// Read a stream to the end, keeping at most `cap` bytes
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

fn render_output(bytes: Vec<u8>, truncated: bool, cap: usize) -> String {
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[output truncated at {cap} bytes]"));
    }
    text
}

fn describe_breach(breach: Breach, limits: &ResourceLimits) -> String {
    match breach {
        Breach::Timeout => format!(
            "[execution killed: exceeded the {}s time limit]",
            limits.timeout.as_secs_f64()
        ),
        Breach::Memory { rss_bytes } => format!(
            "[execution killed: memory use of {} MiB exceeded the {} MiB limit]",
            rss_bytes / (1024 * 1024),
            limits.memory_mb
        ),
    }
}

/// Map how the process ended to a result status and exit code
fn classify(code: Option<i32>, signal: Option<i32>, breach: Option<Breach>) -> (ExecutionStatus, Option<i32>) {
    let status = match (breach, code, signal) {
        (Some(Breach::Timeout), _, _) => ExecutionStatus::Timeout,
        (Some(Breach::Memory { .. }), _, _) => ExecutionStatus::ResourceExceeded,
        (None, Some(0), _) => ExecutionStatus::Success,
        (None, Some(RESOURCE_EXIT_CODE), _) => ExecutionStatus::ResourceExceeded,
        (None, Some(_), _) => ExecutionStatus::RuntimeError,
        // SIGKILL we did not send comes from the kernel OOM killer
        (None, None, Some(sig)) if monitor::is_limit_signal(sig) || sig == 9 => ExecutionStatus::ResourceExceeded,
        (None, None, _) => ExecutionStatus::RuntimeError,
    };
    (status, code)
}

/// Regular files left in the working directory; copied out when a
/// destination is configured
async fn collect_artifacts(dir: PathBuf, keep_in: Option<PathBuf>, execution_id: Uuid) -> Vec<String> {
    let collected = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        walk(&dir, &dir, 0, &mut files);
        files.sort();

        let Some(keep_in) = keep_in else {
            return files.into_iter().map(|rel| rel.to_string_lossy().replace('\\', "/")).collect();
        };
        let target = keep_in.join(execution_id.to_string());
        files
            .into_iter()
            .map(|rel| {
                let dest = target.join(&rel);
                let copied = dest
                    .parent()
                    .map_or(Ok(()), std::fs::create_dir_all)
                    .and_then(|_| std::fs::copy(dir.join(&rel), &dest));
                match copied {
                    Ok(_) => dest.to_string_lossy().to_string(),
                    Err(e) => {
                        tracing::warn!(artifact = %rel.display(), error = %e, "Failed to keep sandbox artifact");
                        rel.to_string_lossy().replace('\\', "/")
                    }
                }
            })
            .collect()
    })
    .await;

    collected.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Artifact collection failed");
        Vec::new()
    })
}

fn walk(root: &Path, dir: &Path, depth: usize, files: &mut Vec<PathBuf>) {
    if depth > MAX_ARTIFACT_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if files.len() >= MAX_ARTIFACTS {
            return;
        }
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if meta.is_dir() {
            if name != "__pycache__" {
                walk(root, &path, depth + 1, files);
            }
        } else if meta.is_file() && !(depth == 0 && runner::is_runner_file(&name)) {
            if let Ok(rel) = path.strip_prefix(root) {
                files.push(rel.to_path_buf());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    macro_rules! require_python {
        () => {
            if !python_available() {
                eprintln!("python3 not found; skipping");
                return;
            }
        };
    }

    fn supervisor(root: &Path, tweak: impl FnOnce(&mut SandboxConfig)) -> SandboxSupervisor {
        let mut config = SandboxConfig {
            backend: "process".to_string(),
            work_root: Some(root.display().to_string()),
            ..SandboxConfig::default()
        };
        tweak(&mut config);
        SandboxSupervisor::new(&config).unwrap()
    }

    fn request(supervisor: &SandboxSupervisor, code: &str, timeout_secs: Option<u64>) -> SandboxRequest {
        supervisor.policy().request(code, timeout_secs, false).unwrap()
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some(0), None, None), (ExecutionStatus::Success, Some(0)));
        assert_eq!(classify(Some(1), None, None), (ExecutionStatus::RuntimeError, Some(1)));
        assert_eq!(
            classify(Some(RESOURCE_EXIT_CODE), None, None).0,
            ExecutionStatus::ResourceExceeded
        );
        assert_eq!(classify(None, Some(9), Some(Breach::Timeout)), (ExecutionStatus::Timeout, None));
        assert_eq!(
            classify(None, Some(9), Some(Breach::Memory { rss_bytes: 1 })).0,
            ExecutionStatus::ResourceExceeded
        );
        assert_eq!(classify(None, Some(9), None).0, ExecutionStatus::ResourceExceeded);
        assert_eq!(classify(None, Some(11), None).0, ExecutionStatus::RuntimeError);
    }

    #[test]
    fn test_render_output_marks_truncation() {
        assert_eq!(render_output(b"abc".to_vec(), false, 3), "abc");
        assert_eq!(
            render_output(b"abc".to_vec(), true, 3),
            "abc\n[output truncated at 3 bytes]"
        );
    }

    #[tokio::test]
    async fn test_read_capped_drains_past_cap() {
        let data: &[u8] = &[7u8; 20_000];
        let (kept, truncated) = read_capped(Some(data), 100).await;
        assert_eq!(kept.len(), 100);
        assert!(truncated);

        let (kept, truncated) = read_capped(Some(&b"short"[..]), 100).await;
        assert_eq!(kept, b"short");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_validation_failure_spawns_nothing() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |_| {});
        let result = supervisor
            .execute(request(&supervisor, "import socket\nsocket.socket()", None))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::ValidationError);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.exit_code, None);
        assert!(supervisor.registry().is_empty());
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_oversized_code_is_a_request_error() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |c| c.max_code_bytes = 16);
        let err = supervisor
            .execute(request(&supervisor, "print('this is far too long')", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_success_with_geo_helpers() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |_| {});
        let result = supervisor
            .execute(request(
                &supervisor,
                "print(haversine_km(52.52, 13.405, 48.8566, 2.3522))",
                None,
            ))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success, "stderr: {}", result.stderr);
        assert_eq!(result.exit_code, Some(0));
        let km: f64 = result.stdout.trim().parse().unwrap();
        assert!((870.0..885.0).contains(&km));
        assert!(result.artifacts.is_empty());
        assert!(is_empty_dir(root.path()));
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |_| {});
        let started = Instant::now();
        let result = supervisor
            .execute(request(&supervisor, "while True:\n    pass\n", Some(2)))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(6));
        assert!(result.elapsed_ms >= 2000);
        assert!(result.stderr.contains("time limit"));
        assert!(is_empty_dir(root.path()));
        assert_eq!(supervisor.available_slots(), supervisor.max_concurrent());
    }

    #[tokio::test]
    async fn test_runtime_error_reports_traceback() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |_| {});
        let result = supervisor
            .execute(request(&supervisor, "raise ValueError('bad input')", None))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("ValueError: bad input"));
    }

    #[tokio::test]
    async fn test_open_is_confined_to_workdir() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |_| {});
        let result = supervisor
            .execute(request(&supervisor, "print(open('/etc/passwd').read())", None))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.stderr.contains("PermissionError"));
        assert!(!result.stdout.contains("root:"));
    }

    async fn run_unchecked_by_validator(code: &str) -> SandboxResult {
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |_| {});
        assert!(validate(code, LIMIT_FOR_TESTS).unwrap().is_empty(), "validator rejected {code:?}");
        supervisor.execute(request(&supervisor, code, None)).await.unwrap()
    }

    const LIMIT_FOR_TESTS: usize = 100 * 1024;

    #[tokio::test]
    async fn test_os_reached_through_another_module_cannot_spawn() {
        require_python!();
        let result = run_unchecked_by_validator(
            "import operator, random as r\noperator.attrgetter('_os')(r).system('echo LEAKED')\n",
        )
        .await;

        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.stderr.contains("os.system is not allowed"), "stderr: {}", result.stderr);
        assert!(!result.stdout.contains("LEAKED"));
    }

    #[tokio::test]
    async fn test_dynamically_named_os_call_is_refused() {
        require_python!();
        let result = run_unchecked_by_validator(
            "import os, operator\noperator.attrgetter('sys' + 'tem')(os)('echo LEAKED')\n",
        )
        .await;

        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.stderr.contains("PermissionError"), "stderr: {}", result.stderr);
        assert!(!result.stdout.contains("LEAKED"));
    }

    #[tokio::test]
    async fn test_low_level_file_access_is_confined() {
        require_python!();
        let result = run_unchecked_by_validator(
            "import os, operator\nfd = operator.methodcaller('open', '/etc/passwd', 0)(os)\nprint(fd)\n",
        )
        .await;
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.stderr.contains("outside the working directory"), "stderr: {}", result.stderr);

        let result = run_unchecked_by_validator("from io import FileIO\nprint(FileIO('/etc/passwd').read())\n").await;
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(!result.stdout.contains("root:"));
    }

    #[tokio::test]
    async fn test_workdir_file_operations_still_work() {
        require_python!();
        let code = "import pathlib\npathlib.Path('out').mkdir()\npathlib.Path('out/a.txt').write_text('x')\nprint([p.name for p in pathlib.Path('out').iterdir()])\nprint(hasattr(random, '_os'), hasattr(json, 'decoder'))\n";
        let result = run_unchecked_by_validator(code).await;

        assert_eq!(result.status, ExecutionStatus::Success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "['a.txt']\nFalse False\n");
    }

    #[tokio::test]
    async fn test_artifacts_are_collected_and_kept() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let keep = tempfile::tempdir().unwrap();
        let keep_path = keep.path().to_path_buf();
        let supervisor = supervisor(root.path(), |c| {
            c.artifacts_dir = Some(keep_path.display().to_string());
        });
        let code = "import os\nos.makedirs('out', exist_ok=True)\nwith open('out/result.csv', 'w') as f:\n    f.write('lat,lon\\n52.5,13.4\\n')\nwith open('summary.txt', 'w') as f:\n    f.write('done')\n";
        let result = supervisor.execute(request(&supervisor, code, None)).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Success, "stderr: {}", result.stderr);
        assert_eq!(result.artifacts.len(), 2);
        assert!(result.artifacts.iter().all(|a| !a.contains("__geoforge_")));
        let csv = result.artifacts.iter().find(|a| a.ends_with("out/result.csv")).unwrap();
        assert!(csv.starts_with(&keep_path.display().to_string()));
        assert_eq!(std::fs::read_to_string(csv).unwrap(), "lat,lon\n52.5,13.4\n");
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |c| c.max_output_bytes = 64);
        let result = supervisor
            .execute(request(&supervisor, "print('x' * 10000)", None))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.stdout_truncated);
        assert!(result.stdout.starts_with(&"x".repeat(64)));
        assert!(result.stdout.ends_with("[output truncated at 64 bytes]"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_ceiling_kills() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = supervisor(root.path(), |c| c.memory_limit_mb = 64);
        let code = "data = b'x' * (256 * 1024 * 1024)\nimport time\ntime.sleep(10)\n";
        let result = supervisor
            .execute(request(&supervisor, code, Some(20)))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::ResourceExceeded, "stderr: {}", result.stderr);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_capacity_exhaustion() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(supervisor(root.path(), |c| {
            c.max_concurrent = 1;
            c.queue_timeout_secs = 0;
        }));

        let busy = {
            let supervisor = supervisor.clone();
            let req = request(&supervisor, "import time\ntime.sleep(2)\n", None);
            tokio::spawn(async move { supervisor.execute(req).await })
        };
        while supervisor.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let err = supervisor
            .execute(request(&supervisor, "print(1)", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable { .. }));

        let first = busy.await.unwrap().unwrap();
        assert_eq!(first.status, ExecutionStatus::Success);
        assert_eq!(supervisor.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_everything() {
        require_python!();
        let root = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(supervisor(root.path(), |_| {}));

        let task = {
            let supervisor = supervisor.clone();
            let req = request(&supervisor, "import time\ntime.sleep(30)\n", None);
            tokio::spawn(async move { supervisor.execute(req).await })
        };
        while supervisor.registry().snapshot().first().and_then(|e| e.pid).is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();
        let _ = task.await;

        assert!(supervisor.registry().is_empty());
        assert!(is_empty_dir(root.path()));
        assert_eq!(supervisor.available_slots(), supervisor.max_concurrent());
    }
}

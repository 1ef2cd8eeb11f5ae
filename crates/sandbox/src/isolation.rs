//! Isolation backends the interpreter is launched under

use geoforge_common::{config::SandboxConfig, errors::AppError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Auto,
    Bwrap,
    Process,
}

impl BackendKind {
    pub fn from_str(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "bwrap" | "bubblewrap" => Some(Self::Bwrap),
            "process" | "none" => Some(Self::Process),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Bwrap => "bwrap",
            Self::Process => "process",
        }
    }
}

/// Host trees the interpreter needs at run time; nothing else is mounted
const SYSTEM_RO_PATHS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/etc/alternatives",
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/ld.so.conf.d",
    "/etc/localtime",
    "/etc/ssl/certs",
];

/// Backend chosen at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationBackend {
    /// System library trees read-only, writable working directory, private /tmp,
    /// fresh pid/ipc/uts namespaces and, unless allowed, no network
    Bwrap { executable: PathBuf },
    /// Plain child with a cleared environment; interpreter-level guards only
    Process,
}

/// Everything needed to start one execution
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub python: &'a str,
    pub runner: &'a Path,
    pub workdir: &'a Path,
    pub env: Vec<(&'static str, String)>,
    pub allow_network: bool,
    /// Host paths mounted read-only under bwrap
    pub ro_binds: &'a [PathBuf],
}

impl IsolationBackend {
    pub fn resolve(config: &SandboxConfig) -> Result<Self> {
        let kind = BackendKind::from_str(&config.backend).ok_or_else(|| AppError::Configuration {
            message: format!("Unknown sandbox backend: {}", config.backend),
        })?;
        let configured = config.bwrap_path.as_ref().map(PathBuf::from);

        match kind {
            BackendKind::Process => {
                tracing::warn!(
                    "Sandbox backend 'process' selected: executions are not isolated from the host \
                     filesystem or network beyond interpreter-level guards"
                );
                Ok(Self::Process)
            }
            // `auto` never degrades to `process`; that must be chosen explicitly
            BackendKind::Bwrap | BackendKind::Auto => resolve_bwrap_executable(configured.as_deref())
                .map(|executable| Self::Bwrap { executable })
                .map_err(|reason| AppError::Configuration {
                    message: format!(
                        "{reason}; install bubblewrap or set sandbox.backend = \"process\" to run without isolation"
                    ),
                }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bwrap { .. } => BackendKind::Bwrap.as_str(),
            Self::Process => BackendKind::Process.as_str(),
        }
    }

    /// Command for `spec` with piped output, no stdin and no inherited environment
    pub fn command(&self, spec: &LaunchSpec<'_>) -> Command {
        let mut cmd = match self {
            Self::Process => {
                let mut cmd = Command::new(spec.python);
                cmd.args(interpreter_args(spec.runner));
                cmd
            }
            Self::Bwrap { executable } => {
                let mut cmd = Command::new(executable);
                cmd.args(build_bwrap_args(spec));
                cmd
            }
        };

        cmd.env_clear()
            .envs(spec.env.iter().map(|(k, v)| (*k, v.as_str())))
            .current_dir(spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

fn interpreter_args(runner: &Path) -> Vec<String> {
    vec![
        "-I".to_string(),
        "-B".to_string(),
        runner.to_string_lossy().to_string(),
    ]
}

fn resolve_bwrap_executable(configured: Option<&Path>) -> std::result::Result<PathBuf, String> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(format!(
            "Configured sandbox bwrap_path does not exist: {}",
            path.to_string_lossy()
        ));
    }

    if !cfg!(target_os = "linux") {
        return Err("bubblewrap is only available on Linux".to_string());
    }
    for candidate in ["bwrap", "bubblewrap"] {
        if let Some(path) = find_executable_in_path(candidate) {
            return Ok(path);
        }
    }
    Err("bubblewrap executable not found (tried bwrap/bubblewrap in PATH)".to_string())
}

pub(crate) fn find_executable_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|base| base.join(name))
        .find(|candidate| candidate.is_file())
}

/// Read-only mounts for `python`: the system trees, the interpreter's own
/// prefix when it lives elsewhere (a venv or /opt install) and `extra`
pub fn readonly_mounts(python: &str, extra: &[String]) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = SYSTEM_RO_PATHS.iter().map(PathBuf::from).collect();

    let given = Path::new(python);
    let resolved = std::fs::canonicalize(given).ok();
    let candidates = [given.is_absolute().then(|| given.to_path_buf()), resolved];
    for interpreter in candidates.into_iter().flatten() {
        let Some(prefix) = interpreter.parent().and_then(Path::parent) else { continue };
        if prefix == Path::new("/") || mounts.iter().any(|m| prefix.starts_with(m)) {
            continue;
        }
        mounts.push(prefix.to_path_buf());
    }

    for path in extra.iter().map(PathBuf::from) {
        if !mounts.contains(&path) {
            mounts.push(path);
        }
    }
    mounts
}

fn build_bwrap_args(spec: &LaunchSpec<'_>) -> Vec<String> {
    let workdir = spec.workdir.to_string_lossy().to_string();
    let mut args: Vec<String> = [
        "--die-with-parent",
        "--new-session",
        "--unshare-pid",
        "--unshare-ipc",
        "--unshare-uts",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    for mount in spec.ro_binds {
        let mount = mount.to_string_lossy().to_string();
        args.extend(["--ro-bind-try".to_string(), mount.clone(), mount]);
    }
    args.extend(
        ["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp", "--tmpfs", "/var/tmp"]
            .into_iter()
            .map(String::from),
    );
    if !spec.allow_network {
        args.push("--unshare-net".to_string());
    }
    // Mounted after the tmpfs so a working directory under /tmp stays visible
    args.extend(["--bind".to_string(), workdir.clone(), workdir.clone()]);
    args.extend(["--chdir".to_string(), workdir]);
    args.push("--".to_string());
    args.push(spec.python.to_string());
    args.extend(interpreter_args(spec.runner));
    args
}

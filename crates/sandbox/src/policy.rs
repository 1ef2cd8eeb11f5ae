//! Execution requests, results and the limits applied to them

use geoforge_common::{config::SandboxConfig, errors::AppError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::validate::Finding;

/// Limits one execution runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_cores: usize,
    pub memory_mb: u64,
    pub timeout: Duration,
    pub allow_network: bool,
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// CPU-seconds ceiling handed to `RLIMIT_CPU`; one second of slack past
    /// the wall-clock deadline so the deadline normally fires first
    pub fn cpu_seconds(&self) -> u64 {
        let secs = self.timeout.as_secs() + u64::from(self.timeout.subsec_nanos() > 0);
        secs.max(1) + 1
    }
}

/// Where the execution's working directory lives and what survives it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkdirPolicy {
    /// Parent of the per-execution directory; the system temp dir when unset
    pub root: Option<PathBuf>,
    /// Copy produced files to this directory before the working directory is removed
    pub keep_artifacts_in: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub code: String,
    pub limits: ResourceLimits,
    pub workdir: WorkdirPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Timeout,
    ResourceExceeded,
    RuntimeError,
    ValidationError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::ValidationError => "validation_error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub artifacts: Vec<String>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
}

impl SandboxResult {
    pub(crate) fn rejected(execution_id: Uuid, findings: Vec<Finding>) -> Self {
        let stderr = findings
            .iter()
            .map(|f| format!("line {}: {}", f.line, f.message))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            execution_id,
            status: ExecutionStatus::ValidationError,
            stdout: String::new(),
            stderr,
            stdout_truncated: false,
            stderr_truncated: false,
            artifacts: Vec::new(),
            elapsed_ms: 0,
            exit_code: None,
            findings,
        }
    }
}

/// Host-wide sandbox policy derived from configuration
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub memory_limit_mb: u64,
    pub cpu_cores: usize,
    pub max_output_bytes: usize,
    pub max_code_bytes: usize,
    pub permit_network: bool,
    pub work_root: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
}

impl From<&SandboxConfig> for SandboxPolicy {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_timeout: Duration::from_secs(config.max_timeout_secs),
            memory_limit_mb: config.memory_limit_mb,
            cpu_cores: config.cpu_cores.max(1),
            max_output_bytes: config.max_output_bytes,
            max_code_bytes: config.max_code_bytes,
            permit_network: config.permit_network,
            work_root: config.work_root.as_ref().map(PathBuf::from),
            artifacts_dir: config.artifacts_dir.as_ref().map(PathBuf::from),
        }
    }
}

impl SandboxPolicy {
    /// Build a request for `code` with the caller's optional overrides.
    ///
    /// A timeout outside `1..=max_timeout` seconds is rejected. Network access
    /// is granted only when both the caller and the host policy allow it.
    pub fn request(
        &self,
        code: impl Into<String>,
        timeout_secs: Option<u64>,
        allow_network: bool,
    ) -> Result<SandboxRequest> {
        let timeout = match timeout_secs {
            None => self.default_timeout,
            Some(0) => return Err(AppError::validation("timeout must be at least 1 second")),
            Some(secs) if Duration::from_secs(secs) > self.max_timeout => {
                return Err(AppError::Validation {
                    message: format!(
                        "timeout of {secs}s exceeds the maximum of {}s",
                        self.max_timeout.as_secs()
                    ),
                    field: Some("timeout".to_string()),
                })
            }
            Some(secs) => Duration::from_secs(secs),
        };

        if allow_network && !self.permit_network {
            tracing::debug!("Network access requested but not permitted; running without it");
        }

        Ok(SandboxRequest {
            code: code.into(),
            limits: ResourceLimits {
                cpu_cores: self.cpu_cores,
                memory_mb: self.memory_limit_mb,
                timeout,
                allow_network: allow_network && self.permit_network,
            },
            workdir: WorkdirPolicy {
                root: self.work_root.clone(),
                keep_artifacts_in: self.artifacts_dir.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(permit_network: bool) -> SandboxPolicy {
        let config = SandboxConfig {
            permit_network,
            ..SandboxConfig::default()
        };
        SandboxPolicy::from(&config)
    }

    #[test]
    fn test_defaults_apply() {
        let request = policy(false).request("print(1)", None, false).unwrap();
        assert_eq!(request.limits.timeout, Duration::from_secs(30));
        assert_eq!(request.limits.memory_mb, 512);
        assert_eq!(request.limits.cpu_cores, 1);
        assert!(!request.limits.allow_network);
        assert_eq!(request.workdir, WorkdirPolicy::default());
    }

    #[test]
    fn test_timeout_bounds() {
        let policy = policy(false);
        assert_eq!(
            policy.request("x", Some(300), false).unwrap().limits.timeout,
            Duration::from_secs(300)
        );
        assert!(matches!(
            policy.request("x", Some(301), false),
            Err(AppError::Validation { .. })
        ));
        assert!(policy.request("x", Some(0), false).is_err());
    }

    #[test]
    fn test_network_needs_host_permission() {
        assert!(!policy(false).request("x", None, true).unwrap().limits.allow_network);
        assert!(policy(true).request("x", None, true).unwrap().limits.allow_network);
        assert!(!policy(true).request("x", None, false).unwrap().limits.allow_network);
    }

    #[test]
    fn test_cpu_seconds_has_slack() {
        let limits = ResourceLimits {
            cpu_cores: 1,
            memory_mb: 64,
            timeout: Duration::from_millis(1500),
            allow_network: false,
        };
        assert_eq!(limits.cpu_seconds(), 3);
        assert_eq!(limits.memory_bytes(), 64 * 1024 * 1024);
    }

    #[test]
    fn test_rejected_result_lists_findings() {
        let findings = crate::validate::validate("import socket", 1024).unwrap();
        let result = SandboxResult::rejected(Uuid::nil(), findings);
        assert_eq!(result.status, ExecutionStatus::ValidationError);
        assert!(result.stderr.contains("line 1"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "validation_error");
        assert_eq!(json["findings"][0]["kind"], "denied_import");
        assert!(json.get("exit_code").is_none());
    }
}

//! Artifact checks run after a sub-agent finishes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use runlane_core::db::unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_VERIFICATION_TIMEOUT_MS: u64 = 30_000;

const TIMEOUT_TARGET: &str = "<verification>";
const TIMEOUT_REASON: &str = "verification_timeout";

/// One expected output file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationArtifact {
    /// Relative to the run's workspace, or absolute.
    pub path: String,
    /// The file must parse as a JSON array.
    pub json: bool,
    pub min_items: Option<usize>,
    /// Keys every array item must carry.
    pub required_keys: Vec<String>,
    pub min_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    RetryOnce,
    Escalate,
    #[default]
    Fail,
}

/// What a spawn promises to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationContract {
    pub artifacts: Vec<VerificationArtifact>,
    pub require_completion_report: bool,
    pub on_failure: OnFailure,
    pub verification_timeout_ms: u64,
}

impl Default for VerificationContract {
    fn default() -> Self {
        Self {
            artifacts: Vec::new(),
            require_completion_report: false,
            on_failure: OnFailure::Fail,
            verification_timeout_ms: DEFAULT_VERIFICATION_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub target: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationCheck {
    fn pass(target: &Path) -> Self {
        Self {
            target: target.display().to_string(),
            passed: true,
            reason: None,
        }
    }

    fn fail(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub checks: Vec<VerificationCheck>,
    /// Unix milliseconds.
    pub verified_at: i64,
}

/// Check every artifact of `contract`, relative to `base_dir`.
///
/// A contract without artifacts is `skipped`. Exceeding the contract's
/// timeout fails the whole verification with a single `verification_timeout`
/// check.
pub async fn verify_artifacts(contract: &VerificationContract, base_dir: &Path) -> VerificationResult {
    if contract.artifacts.is_empty() {
        return VerificationResult {
            status: VerificationStatus::Skipped,
            checks: Vec::new(),
            verified_at: unix_timestamp_ms(),
        };
    }

    let timeout_ms = if contract.verification_timeout_ms == 0 {
        DEFAULT_VERIFICATION_TIMEOUT_MS
    } else {
        contract.verification_timeout_ms
    };

    let checks = async {
        let mut checks = Vec::with_capacity(contract.artifacts.len());
        for artifact in &contract.artifacts {
            checks.push(check_artifact(artifact, base_dir).await);
        }
        checks
    };

    let checks = match tokio::time::timeout(Duration::from_millis(timeout_ms), checks).await {
        Ok(checks) => checks,
        Err(_) => {
            warn!(timeout_ms, "Artifact verification timed out");
            vec![VerificationCheck::fail(TIMEOUT_TARGET, TIMEOUT_REASON)]
        }
    };

    let status = if checks.iter().all(|c| c.passed) {
        VerificationStatus::Passed
    } else {
        VerificationStatus::Failed
    };
    debug!(?status, checks = checks.len(), "Artifacts verified");
    VerificationResult {
        status,
        checks,
        verified_at: unix_timestamp_ms(),
    }
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

async fn check_artifact(artifact: &VerificationArtifact, base_dir: &Path) -> VerificationCheck {
    let trimmed = artifact.path.trim();
    if trimmed.is_empty() {
        return VerificationCheck::fail("", "artifact_path_empty");
    }
    let target = resolve_path(base_dir, trimmed);
    let name = target.display().to_string();

    let Ok(meta) = tokio::fs::metadata(&target).await else {
        return VerificationCheck::fail(name, "artifact_not_found");
    };
    if !meta.is_file() {
        return VerificationCheck::fail(name, "artifact_not_file");
    }
    if let Some(min) = artifact.min_bytes.filter(|m| *m > 0) {
        if meta.len() < min {
            return VerificationCheck::fail(
                name,
                format!("artifact_too_small ({} < {min} bytes)", meta.len()),
            );
        }
    }
    if !artifact.json {
        return VerificationCheck::pass(&target);
    }

    let Ok(raw) = tokio::fs::read_to_string(&target).await else {
        return VerificationCheck::fail(name, "artifact_unreadable");
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return VerificationCheck::fail(name, "artifact_json_parse_failed");
    };
    let Some(items) = parsed.as_array() else {
        return VerificationCheck::fail(name, "artifact_json_not_array");
    };
    if let Some(min) = artifact.min_items.filter(|m| *m > 0) {
        if items.len() < min {
            return VerificationCheck::fail(
                name,
                format!("artifact_json_too_few_items ({} < {min})", items.len()),
            );
        }
    }

    let required: Vec<&str> = artifact
        .required_keys
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    if !required.is_empty() {
        for (i, item) in items.iter().enumerate() {
            let Some(object) = item.as_object() else {
                return VerificationCheck::fail(name, format!("artifact_json_item_not_object_{i}"));
            };
            if let Some(key) = required.iter().find(|k| !object.contains_key(**k)) {
                return VerificationCheck::fail(
                    name,
                    format!("artifact_json_item_missing_required_key_{i}.{key}"),
                );
            }
        }
    }

    VerificationCheck::pass(&target)
}

//! External page-analyzer subprocess wrapper.
//!
//! Spawns the lighthouse-style analyzer binary against a pooled browser's
//! CDP debug port and parses its JSON report. Resolution of the analyzer
//! binary mirrors `browser_setup::find_browser_executable`: an environment
//! override, then well-known install locations, `DependencyMissing` if
//! neither resolves. Uses `tokio::process::Command`, which is non-blocking
//! end-to-end, per the design notes on avoiding a blocking `wait()`.

use crate::error::AuditError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    Mobile,
    Desktop,
}

impl FormFactor {
    fn preset_arg(self) -> &'static str {
        match self {
            FormFactor::Mobile => "--form-factor=mobile",
            FormFactor::Desktop => "--preset=desktop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub description: String,
    pub overall_savings_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreWebVitals {
    pub lcp_ms: Option<f64>,
    pub cls: Option<f64>,
    pub inp_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LighthouseReport {
    pub form_factor: FormFactor,
    pub category_scores: serde_json::Map<String, serde_json::Value>,
    pub core_web_vitals: CoreWebVitals,
    pub opportunities: Vec<Opportunity>,
}

pub async fn find_analyzer_executable() -> Result<PathBuf, AuditError> {
    if let Ok(path) = std::env::var("LIGHTHOUSE_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!("LIGHTHOUSE_PATH points to a non-existent file: {}", path.display());
    }

    let candidates = [
        "/usr/local/bin/lighthouse",
        "/usr/bin/lighthouse",
        "/opt/homebrew/bin/lighthouse",
    ];

    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(output) = std::process::Command::new("which").arg("lighthouse").output()
        && output.status.success()
    {
        let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path_str.is_empty() {
            return Ok(PathBuf::from(path_str));
        }
    }

    Err(AuditError::DependencyMissing("lighthouse analyzer binary".to_string()))
}

fn parse_report(raw: &serde_json::Value, form_factor: FormFactor) -> LighthouseReport {
    let category_scores = raw
        .get("categories")
        .and_then(|v| v.as_object())
        .map(|categories| {
            categories
                .iter()
                .filter_map(|(name, value)| value.get("score").map(|score| (name.clone(), score.clone())))
                .collect()
        })
        .unwrap_or_default();

    let audit_numeric = |id: &str| -> Option<f64> {
        raw.get("audits")
            .and_then(|a| a.get(id))
            .and_then(|a| a.get("numericValue"))
            .and_then(|v| v.as_f64())
    };

    let core_web_vitals = CoreWebVitals {
        lcp_ms: audit_numeric("largest-contentful-paint"),
        cls: audit_numeric("cumulative-layout-shift"),
        inp_ms: audit_numeric("interaction-to-next-paint"),
    };

    let opportunities = raw
        .get("audits")
        .and_then(|v| v.as_object())
        .map(|audits| {
            audits
                .iter()
                .filter(|(_, audit)| {
                    audit.get("details").and_then(|d| d.get("type")).and_then(|t| t.as_str())
                        == Some("opportunity")
                })
                .map(|(id, audit)| Opportunity {
                    id: id.clone(),
                    title: audit.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    description: audit
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    overall_savings_ms: audit
                        .get("details")
                        .and_then(|d| d.get("overallSavingsMs"))
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0),
                })
                .collect()
        })
        .unwrap_or_default();

    LighthouseReport {
        form_factor,
        category_scores,
        core_web_vitals,
        opportunities,
    }
}

/// Runs the analyzer against `url` using the browser listening on
/// `debug_port`, with a deadline of `timeout`. The output path is a temp
/// file the analyzer is instructed to write its JSON report to.
pub async fn run_analysis(
    analyzer: &Path,
    url: &str,
    form_factor: FormFactor,
    debug_port: u16,
    timeout: Duration,
) -> Result<LighthouseReport, AuditError> {
    let output_dir = std::env::temp_dir();
    let output_path = output_dir.join(format!("webauditor_lh_{}.json", uuid::Uuid::new_v4()));

    let mut command = tokio::process::Command::new(analyzer);
    command
        .arg(url)
        .arg(form_factor.preset_arg())
        .arg("--output=json")
        .arg(format!("--output-path={}", output_path.display()))
        .arg("--quiet")
        .arg(format!("--port={debug_port}"))
        .kill_on_drop(true);

    info!(url, ?form_factor, debug_port, "running lighthouse analysis");

    let status = tokio::time::timeout(timeout, command.status())
        .await
        .map_err(|_| AuditError::Timeout(timeout))?
        .map_err(|e| AuditError::Internal(anyhow::anyhow!("failed to spawn analyzer: {e}")))?;

    if !status.success() {
        return Err(AuditError::UpstreamFailure(format!(
            "analyzer exited with status {:?}",
            status.code()
        )));
    }

    let raw_bytes = tokio::fs::read(&output_path)
        .await
        .map_err(|e| AuditError::Internal(anyhow::anyhow!("failed to read analyzer output: {e}")))?;
    let _ = tokio::fs::remove_file(&output_path).await;

    let raw: serde_json::Value = serde_json::from_slice(&raw_bytes)
        .map_err(|e| AuditError::Internal(anyhow::anyhow!("failed to parse analyzer output: {e}")))?;

    Ok(parse_report(&raw, form_factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_report_extracts_category_scores_and_vitals() {
        let raw = json!({
            "categories": {
                "performance": {"score": 0.85},
                "accessibility": {"score": 0.92},
            },
            "audits": {
                "largest-contentful-paint": {"numericValue": 2200.0},
                "cumulative-layout-shift": {"numericValue": 0.05},
                "unused-css-rules": {
                    "title": "Remove unused CSS",
                    "description": "Reduce unused rules.",
                    "details": {"type": "opportunity", "overallSavingsMs": 340.0},
                },
            },
        });

        let report = parse_report(&raw, FormFactor::Mobile);
        assert_eq!(report.category_scores.get("performance"), Some(&json!(0.85)));
        assert_eq!(report.core_web_vitals.lcp_ms, Some(2200.0));
        assert_eq!(report.opportunities.len(), 1);
        assert_eq!(report.opportunities[0].overall_savings_ms, 340.0);
    }

    #[test]
    fn parse_report_tolerates_missing_sections() {
        let raw = json!({});
        let report = parse_report(&raw, FormFactor::Desktop);
        assert!(report.category_scores.is_empty());
        assert!(report.opportunities.is_empty());
        assert_eq!(report.core_web_vitals.lcp_ms, None);
    }
}

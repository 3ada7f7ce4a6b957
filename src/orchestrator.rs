//! Audit Orchestrator (C9): sequences and merges the three downstream
//! analyses per the eight-step protocol.
//!
//! The concurrent two-form-factor lighthouse execution is grounded on the
//! crawl orchestrator's `FuturesUnordered`-driven concurrent task pattern;
//! the singleflight/cache interplay and unconditional lock release are new
//! to this crate (no teacher equivalent runs a reentrant cache probe around
//! a mutual-exclusion lock), composed from the cache (C2) and singleflight
//! (C3) APIs defined elsewhere in this crate.

use crate::browser_pool::BrowserPool;
use crate::cache::TtlCache;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::field_data::{self, FieldDataReport};
use crate::lighthouse::{self, FormFactor, LighthouseReport};
use crate::metrics::{classify_outcome, AuditOutcome};
use crate::model::AuditStage;
use crate::singleflight::SingleFlight;
use crate::synthesis::{self, SynthesisInput, SynthesisReport};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct AuditReport {
    pub status: AuditStatus,
    pub url: String,
    pub lighthouse_mobile: Option<LighthouseReport>,
    pub lighthouse_desktop: Option<LighthouseReport>,
    pub field_data: Option<FieldDataReport>,
    pub synthesis: Option<SynthesisReport>,
    pub error: Option<String>,
    pub timing_ms: std::collections::HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Partial,
    Failed,
}

impl From<AuditOutcome> for AuditStatus {
    fn from(outcome: AuditOutcome) -> Self {
        match outcome {
            AuditOutcome::Success => AuditStatus::Success,
            AuditOutcome::Partial => AuditStatus::Partial,
            AuditOutcome::Failed => AuditStatus::Failed,
        }
    }
}

/// Stage lifecycle hooks through which the job registry (C5) updates status
/// and the broadcaster (C8) emits progress.
pub trait StageCallbacks: Send + Sync {
    fn on_stage_start(&self, stage: AuditStage);
    fn on_stage_complete(&self, stage: AuditStage);
}

pub struct AuditDependencies {
    pub cache: Arc<TtlCache>,
    pub singleflight: Arc<SingleFlight>,
    pub browser_pool: Arc<BrowserPool>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub http_client: reqwest::Client,
    pub psi_api_key: String,
    pub google_api_key: String,
    pub analyzer_path: PathBuf,
}

/// Runs the full eight-step protocol for one URL.
pub async fn run_audit(
    deps: &AuditDependencies,
    url: &str,
    timeout: Duration,
    no_cache: bool,
    callbacks: &dyn StageCallbacks,
) -> AuditReport {
    // Step 1: cache probe.
    if !no_cache
        && let Some(entry) = deps.cache.get(url).await
        && let Ok(report) = serde_json::from_value::<AuditReport>(entry.report)
    {
        info!(url, "cache hit, skipping audit");
        return report;
    }

    // Step 2: singleflight acquire, with a re-probe on the losing side.
    let guard = deps.singleflight.acquire(url).await;
    if !guard.was_first() && !no_cache {
        if let Some(entry) = deps.cache.get(url).await
            && let Ok(report) = serde_json::from_value::<AuditReport>(entry.report)
        {
            deps.singleflight.release(guard.key());
            return report;
        }
    }

    let report = run_audit_locked(deps, url, timeout, no_cache, callbacks).await;

    // Step 8: release the singleflight lock unconditionally.
    deps.singleflight.release(guard.key());
    report
}

async fn run_audit_locked(
    deps: &AuditDependencies,
    url: &str,
    timeout: Duration,
    no_cache: bool,
    callbacks: &dyn StageCallbacks,
) -> AuditReport {
    let mut timing_ms = std::collections::HashMap::new();
    let mut errors: Vec<String> = Vec::new();

    // Step 3: lighthouse stage (critical).
    let lighthouse_started = Instant::now();
    callbacks.on_stage_start(AuditStage::LighthouseMobile);
    callbacks.on_stage_start(AuditStage::LighthouseDesktop);

    let stage_timeout = timeout / 2;
    let (mobile_result, desktop_result) = run_lighthouse_pair(deps, url, stage_timeout).await;
    timing_ms.insert("lighthouse".to_string(), lighthouse_started.elapsed().as_millis() as u64);

    let mobile = match &mobile_result {
        Ok(_) => {
            callbacks.on_stage_complete(AuditStage::LighthouseMobile);
            true
        }
        Err(e) => {
            warn!(url, error = %e, "mobile lighthouse failed");
            errors.push(format!("Lighthouse mobile: {e}"));
            false
        }
    };

    let desktop = match &desktop_result {
        Ok(_) => {
            callbacks.on_stage_complete(AuditStage::LighthouseDesktop);
            true
        }
        Err(e) => {
            warn!(url, error = %e, "desktop lighthouse failed");
            errors.push(format!("Lighthouse desktop: {e}"));
            false
        }
    };

    if !mobile && !desktop {
        return AuditReport {
            status: AuditStatus::Failed,
            url: url.to_string(),
            lighthouse_mobile: None,
            lighthouse_desktop: None,
            field_data: None,
            synthesis: None,
            error: Some(errors.join("; ")),
            timing_ms,
        };
    }

    // Step 4: field-data stage (optional).
    callbacks.on_stage_start(AuditStage::CrUX);
    let field_started = Instant::now();
    let field_data = match field_data::fetch_field_data(&deps.http_client, &deps.psi_api_key, url, &deps.breakers.psi).await {
        Ok(report) => {
            callbacks.on_stage_complete(AuditStage::CrUX);
            report
        }
        Err(e) => {
            warn!(url, error = %e, "field data stage degraded");
            errors.push(format!("CrUX: {e}"));
            None
        }
    };
    timing_ms.insert("field_data".to_string(), field_started.elapsed().as_millis() as u64);

    // Step 5: synthesis stage (optional).
    callbacks.on_stage_start(AuditStage::AiAnalysis);
    let synthesis_started = Instant::now();
    let lighthouse_summary = serde_json::json!({
        "mobile": mobile_result.as_ref().ok(),
        "desktop": desktop_result.as_ref().ok(),
    });
    let synthesis_input = SynthesisInput {
        url: url.to_string(),
        lighthouse_summary,
        field_data_summary: field_data.as_ref().and_then(|f| serde_json::to_value(f).ok()),
    };
    let synthesis = match synthesis::synthesize(&deps.http_client, &deps.google_api_key, &deps.breakers.ai, synthesis_input).await {
        Ok(report) => {
            callbacks.on_stage_complete(AuditStage::AiAnalysis);
            report
        }
        Err(e) => {
            warn!(url, error = %e, "synthesis stage degraded");
            errors.push(format!("AI analysis: {e}"));
            None
        }
    };
    timing_ms.insert("synthesis".to_string(), synthesis_started.elapsed().as_millis() as u64);

    // Step 6: merge.
    let outcome = classify_outcome(true, field_data.is_some(), synthesis.is_some());
    let report = AuditReport {
        status: outcome.into(),
        url: url.to_string(),
        lighthouse_mobile: mobile_result.ok(),
        lighthouse_desktop: desktop_result.ok(),
        field_data,
        synthesis,
        error: if errors.is_empty() { None } else { Some(errors.join("; ")) },
        timing_ms,
    };

    // Step 7: cache store, never propagating a write failure.
    if !no_cache
        && outcome != AuditOutcome::Failed
        && let Ok(value) = serde_json::to_value(&report)
    {
        deps.cache.put(url, &value).await;
    }

    report
}

async fn run_lighthouse_pair(
    deps: &AuditDependencies,
    url: &str,
    stage_timeout: Duration,
) -> (
    Result<LighthouseReport, crate::error::AuditError>,
    Result<LighthouseReport, crate::error::AuditError>,
) {
    let mobile_guard = deps.browser_pool.acquire().await;
    let desktop_guard = deps.browser_pool.acquire().await;

    let mobile_fut = async {
        match &mobile_guard {
            Ok(guard) => {
                lighthouse::run_analysis(&deps.analyzer_path, url, FormFactor::Mobile, guard.debug_port(), stage_timeout).await
            }
            Err(e) => Err(crate::error::AuditError::DependencyMissing(format!("browser pool: {e}"))),
        }
    };

    let desktop_fut = async {
        match &desktop_guard {
            Ok(guard) => {
                lighthouse::run_analysis(&deps.analyzer_path, url, FormFactor::Desktop, guard.debug_port(), stage_timeout).await
            }
            Err(e) => Err(crate::error::AuditError::DependencyMissing(format!("browser pool: {e}"))),
        }
    };

    tokio::join!(mobile_fut, desktop_fut)
}


//! Generative-model narrative synthesis, guarded by the `google_ai` circuit
//! breaker and offloaded to a worker thread per the orchestrator's step 5.
//!
//! The exact prompt text and wire format of the model call are out of
//! scope (§1 Out of scope); this module owns only the request/response
//! contract the orchestrator needs: take the lighthouse + field-data
//! summary in, get a structured narrative report out.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::AuditError;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub url: String,
    pub lighthouse_summary: serde_json::Value,
    pub field_data_summary: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisReport {
    pub narrative: String,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Calls the generative model, guarded by the `ai` breaker, with the actual
/// request offloaded to a worker thread via `spawn_blocking` so a slow
/// model call never stalls the async runtime's cooperative scheduler.
pub async fn synthesize(
    client: &reqwest::Client,
    api_key: &str,
    breaker: &CircuitBreaker,
    input: SynthesisInput,
) -> Result<Option<SynthesisReport>, AuditError> {
    if !breaker.can_execute() {
        return Err(AuditError::DependencyMissing("google_ai circuit breaker open".to_string()));
    }

    let client = client.clone();
    let api_key = api_key.to_string();

    let result = tokio::task::spawn_blocking(move || {
        let runtime = tokio::runtime::Handle::current();
        runtime.block_on(call_model(&client, &api_key, &input))
    })
    .await
    .map_err(|e| AuditError::Internal(anyhow::anyhow!("synthesis worker thread panicked: {e}")))?;

    match result {
        Ok(report) => {
            breaker.record_success();
            Ok(Some(report))
        }
        Err(e) => {
            breaker.record_failure();
            warn!(error = %e, "synthesis call failed, degrading gracefully");
            Err(AuditError::UpstreamFailure(e.to_string()))
        }
    }
}

async fn call_model(
    client: &reqwest::Client,
    api_key: &str,
    input: &SynthesisInput,
) -> anyhow::Result<SynthesisReport> {
    let endpoint = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent?key={api_key}"
    );

    let prompt = format!(
        "Summarize the page quality audit for {} given: {}",
        input.url,
        serde_json::to_string(&input.lighthouse_summary)?
    );

    let response = client
        .post(&endpoint)
        .json(&serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("synthesis API returned {}", response.status());
    }

    let body: serde_json::Value = response.json().await?;
    let text = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .and_then(|a| a.first())
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(SynthesisReport {
        narrative: text,
        key_findings: Vec::new(),
        recommendations: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn open_breaker_short_circuits_before_any_request() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            success_threshold: 1,
        });
        breaker.record_failure();

        let client = reqwest::Client::new();
        let input = SynthesisInput {
            url: "https://example.com/".to_string(),
            lighthouse_summary: serde_json::json!({}),
            field_data_summary: None,
        };

        let result = synthesize(&client, "test-key", &breaker, input).await;
        assert!(matches!(result, Err(AuditError::DependencyMissing(_))));
    }
}

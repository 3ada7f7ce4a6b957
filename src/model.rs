//! Core data types shared across components: `Job`, `QueueEntry`,
//! `CacheEntry`, and the stage/status enums they're built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    LighthouseMobile,
    LighthouseDesktop,
    CrUX,
    AiAnalysis,
}

impl AuditStage {
    pub const ALL: [AuditStage; 4] = [
        AuditStage::LighthouseMobile,
        AuditStage::LighthouseDesktop,
        AuditStage::CrUX,
        AuditStage::AiAnalysis,
    ];
}

/// The unit of work visible to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub current_stage: Option<AuditStage>,
    pub completed_stages: HashSet<AuditStage>,
    pub queue_position: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub client_ip: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: String, url: String, client_ip: String) -> Self {
        Self {
            id,
            url,
            status: JobStatus::Pending,
            current_stage: None,
            completed_stages: HashSet::new(),
            queue_position: None,
            created_at: Utc::now(),
            client_ip,
            result: None,
            error: None,
        }
    }

    /// `len(completed_stages) / 4 * 100`, rounded down.
    pub fn progress_percent(&self) -> u32 {
        ((self.completed_stages.len() * 100) / AuditStage::ALL.len()) as u32
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEntryStatus {
    Pending,
    Processing,
    Cancelled,
}

/// A persisted record of deferred work, mirrored 1:1 to the `audit_queue` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub job_id: String,
    pub url: String,
    pub options: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: QueueEntryStatus,
}

/// A prior audit result read back from the TTL cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub report: serde_json::Value,
    pub created_at: f64,
    pub ttl_seconds: i64,
}

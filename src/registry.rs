//! In-memory job registry (C5) with per-client-IP quota enforcement.
//!
//! Grounded on the teacher's `DashMap`-based shared-state idiom (used
//! throughout for registries keyed by id) and on the job store's
//! `max_jobs_per_ip` quota check: a client is refused a new job while it
//! already has `max_jobs_per_ip` jobs in a non-terminal state.

use crate::model::{AuditStage, Job, JobStatus};
use dashmap::DashMap;
use std::sync::Arc;

/// Holds every job currently known to the process, live or finished but not
/// yet swept. Not persisted: a process restart loses in-flight job state,
/// which is acceptable because the queue (C4) is what survives restarts —
/// submitters re-poll and get a fresh job id after a crash.
pub struct JobRegistry {
    jobs: DashMap<String, Job>,
    max_jobs_per_ip: usize,
}

impl JobRegistry {
    pub fn new(max_jobs_per_ip: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            max_jobs_per_ip,
        }
    }

    /// Counts this client's non-terminal jobs and refuses creation if it's
    /// already at the per-IP cap.
    pub fn create(&self, id: String, url: String, client_ip: String) -> Result<Job, usize> {
        let active_for_ip = self
            .jobs
            .iter()
            .filter(|entry| entry.client_ip == client_ip && !entry.is_terminal())
            .count();

        if active_for_ip >= self.max_jobs_per_ip {
            return Err(active_for_ip);
        }

        let job = Job::new(id.clone(), url, client_ip);
        self.jobs.insert(id, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Job> {
        self.jobs.remove(id).map(|(_, job)| job)
    }

    pub fn update_stage(&self, id: &str, stage: AuditStage) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.status = JobStatus::Running;
            entry.current_stage = Some(stage);
        }
    }

    pub fn complete_stage(&self, id: &str, stage: AuditStage) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.completed_stages.insert(stage);
        }
    }

    pub fn complete(&self, id: &str, result: serde_json::Value) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.status = JobStatus::Completed;
            entry.current_stage = None;
            entry.result = Some(result);
        }
    }

    pub fn fail(&self, id: &str, error: String) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.status = JobStatus::Failed;
            entry.current_stage = None;
            entry.error = Some(error);
        }
    }

    pub fn update_status_and_position(&self, id: &str, status: JobStatus, queue_position: Option<usize>) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.status = status;
            entry.queue_position = queue_position;
        }
    }

    /// Drops terminal jobs older than `max_age_seconds`, returning the count
    /// removed. Non-terminal jobs are never swept regardless of age.
    pub fn cleanup_expired(&self, max_age_seconds: i64) -> usize {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(max_age_seconds);
        let stale: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| entry.is_terminal() && entry.created_at < cutoff)
            .map(|entry| entry.id.clone())
            .collect();

        for id in &stale {
            self.jobs.remove(id);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All jobs not yet in a terminal state, for the running-audits listing.
    pub fn list_running(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| !entry.is_terminal())
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.jobs.iter() {
            match entry.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RegistryStats {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

pub type SharedJobRegistry = Arc<JobRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_blocks_a_sixth_active_job_for_the_same_ip() {
        let registry = JobRegistry::new(5);
        for i in 0..5 {
            registry
                .create(format!("job-{i}"), "https://example.com/".into(), "1.2.3.4".into())
                .expect("job should be admitted");
        }
        let result = registry.create("job-6".into(), "https://example.com/".into(), "1.2.3.4".into());
        assert_eq!(result.unwrap_err(), 5);
    }

    #[test]
    fn completed_jobs_do_not_count_against_quota() {
        let registry = JobRegistry::new(1);
        registry
            .create("job-1".into(), "https://example.com/".into(), "1.2.3.4".into())
            .unwrap();
        registry.complete("job-1", serde_json::json!({"status": "success"}));

        let second = registry.create("job-2".into(), "https://example.com/".into(), "1.2.3.4".into());
        assert!(second.is_ok());
    }

    #[test]
    fn distinct_ips_have_independent_quotas() {
        let registry = JobRegistry::new(1);
        registry
            .create("job-1".into(), "https://example.com/".into(), "1.2.3.4".into())
            .unwrap();
        let other_ip = registry.create("job-2".into(), "https://example.com/".into(), "5.6.7.8".into());
        assert!(other_ip.is_ok());
    }

    #[test]
    fn cleanup_expired_only_removes_old_terminal_jobs() {
        let registry = JobRegistry::new(5);
        registry
            .create("job-1".into(), "https://example.com/".into(), "1.2.3.4".into())
            .unwrap();
        registry.complete("job-1", serde_json::json!({}));

        // Not yet old enough to be swept.
        assert_eq!(registry.cleanup_expired(3600), 0);
        assert!(registry.get("job-1").is_some());

        // An immediately-expired cutoff sweeps it.
        assert_eq!(registry.cleanup_expired(-1), 1);
        assert!(registry.get("job-1").is_none());
    }
}

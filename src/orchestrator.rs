use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::cleanup::CleanupPlan;
use crate::config::Config;
use crate::create_timestamp;
use crate::database::{self as db, Job, JobFilter, JobStats, ScanState, VmState};
use crate::disk::DiskProvisioner;
use crate::error::{Error, Result};
use crate::paths::{self, JobPaths};
use crate::scanner::{RuleEngine, ScanReport, ScanStatus};
use crate::sha256_hex;
use crate::vm::Supervisor;

/// Knobs a submitter may set per job.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    pub image_size_mib: Option<u64>,
}

/// The job lifecycle state machine.
///
/// Sequences ingestion, provisioning, scanning, VM supervision, persistence
/// and cleanup for each submission. Operations on the same job id are
/// serialized by a per-id lock; distinct jobs share nothing but the store.
pub struct Orchestrator {
    config: Config,
    pool: Arc<SqlitePool>,
    engine: RuleEngine,
    supervisor: Supervisor,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Orchestrator {
    pub fn new(config: Config, pool: Arc<SqlitePool>) -> Self {
        let engine = RuleEngine::new(&config.scanner, paths::rules_dir(&config.storage));
        let supervisor = Supervisor::new(config.vm.clone(), pool.clone());
        Self {
            config,
            pool,
            engine,
            supervisor,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// One-time bootstrap: base directory layout plus the default rule set.
    pub async fn init(&self) -> Result<()> {
        for dir in paths::base_layout(&self.config.storage) {
            tokio::fs::create_dir_all(&dir).await?;
            log::info!("Initialized directory: {}", dir.display());
        }
        self.engine.init_rules().await
    }

    fn job_lock(&self, job_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    fn discard_lock(&self, job_id: &str) {
        self.locks.lock().unwrap().remove(job_id);
    }

    fn paths(&self, job_id: &str) -> JobPaths {
        JobPaths::new(&self.config.storage, job_id)
    }

    /// Ingest a submission: stage, hash, persist, provision, scan.
    ///
    /// The row is created before any further artifact so it can anchor
    /// cleanup. On the first fatal error the job goes to `failed` and the
    /// cleanup plan runs; with nothing left on disk the row is removed too,
    /// so a failed submit leaves no trace.
    pub async fn submit(&self, bytes: &[u8], name: &str, options: SubmitOptions) -> Result<Job> {
        if name.is_empty() {
            return Err(Error::Validation("file name must not be empty".to_string()));
        }

        let job_id = Uuid::new_v4().to_string();
        let job_paths = self.paths(&job_id);
        let provisioner = DiskProvisioner::new(
            options
                .image_size_mib
                .unwrap_or(self.config.disk.image_size_mib),
        );

        tokio::fs::write(&job_paths.upload, bytes).await?;

        // the content hash is computed exactly once, over the full stream
        let content_hash = sha256_hex(bytes);
        log::info!(
            "File uploaded: {name} (jobID: {job_id}, size: {} bytes, sha256: {content_hash})",
            bytes.len()
        );

        let now = create_timestamp();
        let job = Job {
            id: job_id.clone(),
            content_hash,
            original_name: name.to_string(),
            size_bytes: bytes.len() as i64,
            disk_path: job_paths.disk_image.display().to_string(),
            vm_state: VmState::Pending,
            scan_state: ScanState::Pending,
            created_at: now.clone(),
            updated_at: now,
        };
        if let Err(e) = db::create_job(&self.pool, &job).await {
            let _ = tokio::fs::remove_file(&job_paths.upload).await;
            return Err(e);
        }

        match self.ingest(&job_id, &job_paths, &provisioner, bytes.len() as u64).await {
            Ok(job) => Ok(job),
            Err(e) => {
                log::error!("job {job_id}: submit failed: {e}");
                let _ = db::update_vm_state(&self.pool, &job_id, VmState::Failed).await;
                let outcome = self.plan(&job_id, &job_paths).run().await;
                if !outcome.failures.is_empty() {
                    log::warn!(
                        "job {job_id}: cleanup after failed submit left artifacts: {:?}",
                        outcome.failures
                    );
                }
                Err(e)
            }
        }
    }

    async fn ingest(
        &self,
        job_id: &str,
        job_paths: &JobPaths,
        provisioner: &DiskProvisioner,
        upload_size: u64,
    ) -> Result<Job> {
        provisioner.provision(job_paths, upload_size).await?;

        db::update_scan_state(&self.pool, job_id, &ScanState::Scanning).await?;
        let report = self.engine.scan(job_id, &job_paths.upload).await;
        self.engine
            .save_report(&report, &job_paths.scan_report)
            .await?;
        let verdict = scan_state_for(&report);
        db::update_scan_state(&self.pool, job_id, &verdict).await?;
        log_verdict(job_id, &report);

        if report.status == ScanStatus::Error {
            return Err(Error::ExternalTool {
                tool: "yara",
                detail: report
                    .error_msg
                    .unwrap_or_else(|| "scan failed".to_string()),
            });
        }

        db::update_vm_state(&self.pool, job_id, VmState::Ready).await?;
        db::fetch_job(&self.pool, job_id).await
    }

    /// Detonate: launch the micro-VM with the job's image attached.
    ///
    /// Requires `vm_state = ready`. The VM is fire-and-forget; verdicts come
    /// only from the static scan. A supervisor failure leaves the job
    /// `failed` with its disk artifacts intact for inspection, while the
    /// VM-scoped artifacts are already gone.
    pub async fn run(&self, job_id: &str, enable_network: Option<bool>) -> Result<Job> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let job = db::fetch_job(&self.pool, job_id).await?;
        if job.vm_state != VmState::Ready {
            return Err(Error::InvalidState {
                id: job_id.to_string(),
                state: job.vm_state.as_str().to_string(),
                expected: "ready",
            });
        }

        let job_paths = self.paths(job_id);
        if !job_paths.disk_image.exists() {
            return Err(Error::Validation(format!(
                "disk image missing for job {job_id}"
            )));
        }

        let network = enable_network.unwrap_or(self.config.vm.enable_network);
        match self.supervisor.launch(job_id, &job_paths, network).await {
            // the supervisor records `running` itself, before its watcher
            // can possibly report an exit
            Ok(()) => db::fetch_job(&self.pool, job_id).await,
            Err(e) => {
                let _ = db::update_vm_state(&self.pool, job_id, VmState::Failed).await;
                Err(e)
            }
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        db::fetch_job(&self.pool, job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        db::fetch_jobs_by_query(&self.pool, filter).await
    }

    pub async fn stats(&self) -> Result<JobStats> {
        db::job_stats(&self.pool).await
    }

    /// Re-run the static scan over the staged upload.
    pub async fn rescan(&self, job_id: &str) -> Result<ScanReport> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        db::fetch_job(&self.pool, job_id).await?;
        let job_paths = self.paths(job_id);
        if !job_paths.upload.exists() {
            return Err(Error::Validation(format!(
                "staged upload no longer present for job {job_id}"
            )));
        }

        db::update_scan_state(&self.pool, job_id, &ScanState::Scanning).await?;
        let report = self.engine.scan(job_id, &job_paths.upload).await;
        self.engine
            .save_report(&report, &job_paths.scan_report)
            .await?;
        db::update_scan_state(&self.pool, job_id, &scan_state_for(&report)).await?;
        log_verdict(job_id, &report);
        Ok(report)
    }

    /// The persisted scan report document.
    pub async fn report(&self, job_id: &str) -> Result<ScanReport> {
        db::fetch_job(&self.pool, job_id).await?;
        let job_paths = self.paths(job_id);
        self.engine.load_report(job_id, &job_paths.scan_report).await
    }

    /// Tear down every artifact of a job and, when everything converges,
    /// its row. Unknown ids are `NotFound`; the planner itself is idempotent.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        db::fetch_job(&self.pool, job_id).await?;

        let job_paths = self.paths(job_id);
        let outcome = self.plan(job_id, &job_paths).run().await;
        if outcome.row_deleted {
            self.discard_lock(job_id);
        }

        if outcome.failures.is_empty() {
            log::info!("Successfully cleaned up job: {job_id}");
            Ok(())
        } else {
            Err(Error::PartialCleanup(outcome.failures))
        }
    }

    /// Stops every running VM; called once on process shutdown.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown_all().await;
    }

    fn plan<'a>(&'a self, job_id: &'a str, job_paths: &'a JobPaths) -> CleanupPlan<'a> {
        CleanupPlan {
            job_id,
            paths: job_paths,
            pool: &self.pool,
            supervisor: Some(&self.supervisor),
        }
    }
}

/// Folds a scan report into the store's verdict field.
pub fn scan_state_for(report: &ScanReport) -> ScanState {
    match report.status {
        ScanStatus::Clean => ScanState::Clean,
        ScanStatus::MalwareDetected => ScanState::Suspicious(report.match_count as u32),
        ScanStatus::CriticalThreat => ScanState::Critical,
        ScanStatus::Error => ScanState::Error,
    }
}

fn log_verdict(job_id: &str, report: &ScanReport) {
    if report.match_count > 0 {
        log::warn!(
            "job {job_id}: {} YARA rules matched ({:?})",
            report.match_count,
            report.status
        );
        for detection in &report.detections {
            log::warn!(
                "job {job_id}:   {} - {} (severity: {})",
                detection.rule_name,
                detection.description,
                detection.severity
            );
        }
    } else if report.status == ScanStatus::Clean {
        log::info!("job {job_id}: file is clean (no YARA matches)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Detection, Severity};

    fn report(status: ScanStatus, detections: Vec<Detection>) -> ScanReport {
        ScanReport {
            job_id: "j1".to_string(),
            timestamp: create_timestamp(),
            match_count: detections.len(),
            detections,
            total_rules: 1,
            status,
            scan_time: 0.0,
            error_msg: None,
        }
    }

    fn detection(severity: Severity) -> Detection {
        Detection {
            rule_name: "R".to_string(),
            tags: vec![],
            description: "d".to_string(),
            severity,
        }
    }

    #[test]
    fn test_scan_state_mapping() {
        assert_eq!(
            scan_state_for(&report(ScanStatus::Clean, vec![])),
            ScanState::Clean
        );
        assert_eq!(
            scan_state_for(&report(
                ScanStatus::MalwareDetected,
                vec![detection(Severity::High), detection(Severity::Low)]
            )),
            ScanState::Suspicious(2)
        );
        assert_eq!(
            scan_state_for(&report(
                ScanStatus::CriticalThreat,
                vec![detection(Severity::Critical)]
            )),
            ScanState::Critical
        );
        assert_eq!(
            scan_state_for(&report(ScanStatus::Error, vec![])),
            ScanState::Error
        );
    }
}

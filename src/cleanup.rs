use std::io::ErrorKind;
use std::path::Path;

use sqlx::SqlitePool;
use tokio::process::Command;

use crate::database as db;
use crate::error::CleanupFailure;
use crate::paths::JobPaths;
use crate::vm::Supervisor;

/// Best-effort teardown of every artifact a job may own, in reverse
/// creation order. Steps run independently; absence counts as success, so
/// repeating a plan converges to an empty failure list.
pub struct CleanupPlan<'a> {
    pub job_id: &'a str,
    pub paths: &'a JobPaths,
    pub pool: &'a SqlitePool,
    pub supervisor: Option<&'a Supervisor>,
}

#[derive(Debug, Default)]
pub struct CleanupOutcome {
    pub failures: Vec<CleanupFailure>,
    pub row_deleted: bool,
}

impl CleanupPlan<'_> {
    pub async fn run(&self) -> CleanupOutcome {
        let mut failures = Vec::new();

        // 1. the hypervisor holds the socket, chroot and loop device open;
        //    nothing below is reclaimable while it lives
        if let Some(supervisor) = self.supervisor {
            if supervisor.stop(self.job_id).await {
                log::info!("job {}: hypervisor stopped for cleanup", self.job_id);
            }
        }

        // 2. the staging mount, if a provisioning failure left it behind
        unmount(&self.paths.mount_dir, &mut failures).await;

        // 3.-8. plain filesystem artifacts
        remove_dir("mount dir", &self.paths.mount_dir, &mut failures).await;
        remove_file("control socket", &self.paths.api_socket, &mut failures).await;
        remove_tree("chroot", &self.paths.chroot_dir, &mut failures).await;
        remove_file("disk image", &self.paths.disk_image, &mut failures).await;
        remove_file("upload", &self.paths.upload, &mut failures).await;
        remove_file("scan report", &self.paths.scan_report, &mut failures).await;

        // 9. the row is the cleanup anchor: it goes only once everything it
        //    anchors is gone, otherwise it stays behind for triage
        let mut row_deleted = false;
        if failures.is_empty() {
            match db::delete_job(self.pool, self.job_id).await {
                Ok(deleted) => {
                    row_deleted = deleted;
                    if deleted {
                        log::info!("job {}: removed from store", self.job_id);
                    }
                }
                Err(e) => failures.push(CleanupFailure {
                    step: "job row",
                    detail: e.to_string(),
                }),
            }
        } else {
            log::warn!(
                "job {}: retaining row after {} failed cleanup steps",
                self.job_id,
                failures.len()
            );
        }

        CleanupOutcome {
            failures,
            row_deleted,
        }
    }
}

async fn unmount(mount_dir: &Path, failures: &mut Vec<CleanupFailure>) {
    if !mount_dir.exists() {
        return;
    }
    match Command::new("umount").arg(mount_dir).output().await {
        Ok(output) if output.status.success() => {
            log::debug!("unmounted {}", mount_dir.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not mounted") && !stderr.contains("no mount point") {
                failures.push(CleanupFailure {
                    step: "unmount",
                    detail: stderr.trim().to_string(),
                });
            }
        }
        Err(e) => failures.push(CleanupFailure {
            step: "unmount",
            detail: e.to_string(),
        }),
    }
}

async fn remove_file(step: &'static str, path: &Path, failures: &mut Vec<CleanupFailure>) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("removed {step}: {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => failures.push(CleanupFailure {
            step,
            detail: format!("{}: {e}", path.display()),
        }),
    }
}

async fn remove_dir(step: &'static str, path: &Path, failures: &mut Vec<CleanupFailure>) {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => log::debug!("removed {step}: {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => failures.push(CleanupFailure {
            step,
            detail: format!("{}: {e}", path.display()),
        }),
    }
}

async fn remove_tree(step: &'static str, path: &Path, failures: &mut Vec<CleanupFailure>) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => log::debug!("removed {step}: {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => failures.push(CleanupFailure {
            step,
            detail: format!("{}: {e}", path.display()),
        }),
    }
}

use std::path::PathBuf;

use crate::config::StorageConfig;

/// Every host artifact a job may own, derived from its id alone.
///
/// Creation and cleanup both go through this record, so the two can never
/// disagree about what belongs to a job. Pure derivation, no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    /// Staged submission bytes
    pub upload: PathBuf,
    /// Per-job block image handed to the VM
    pub disk_image: PathBuf,
    /// Ephemeral loopback mount used while staging the image
    pub mount_dir: PathBuf,
    /// Per-job chroot tree for the jailed hypervisor
    pub chroot_dir: PathBuf,
    /// Hypervisor control socket
    pub api_socket: PathBuf,
    /// Persisted scan report document
    pub scan_report: PathBuf,
    /// Host TAP interface name (used only when networking is enabled)
    pub tap_name: String,
}

impl JobPaths {
    pub fn new(storage: &StorageConfig, job_id: &str) -> Self {
        let base = &storage.base_dir;
        let chroot_dir = base.join("vms").join(job_id);
        let tap_suffix: String = job_id.chars().take(8).collect();
        Self {
            upload: base.join("uploads").join(format!("{job_id}.bin")),
            disk_image: base.join("disks").join(format!("input-{job_id}.ext4")),
            mount_dir: base.join("mnt").join(format!("input-{job_id}")),
            api_socket: chroot_dir.join("api.sock"),
            scan_report: base.join("scan_results").join(format!("{job_id}.json")),
            tap_name: format!("tap-{tap_suffix}"),
            chroot_dir,
        }
    }
}

/// Directory holding `*.yar` rule files.
pub fn rules_dir(storage: &StorageConfig) -> PathBuf {
    storage.base_dir.join("yara_rules")
}

/// Location of the SQLite job store.
pub fn db_path(storage: &StorageConfig) -> PathBuf {
    storage.base_dir.join("vmscan.sqlite3")
}

/// Directories that must exist before any job can be accepted.
pub fn base_layout(storage: &StorageConfig) -> Vec<PathBuf> {
    ["uploads", "disks", "mnt", "vms", "scan_results"]
        .iter()
        .map(|dir| storage.base_dir.join(dir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn storage() -> StorageConfig {
        StorageConfig {
            base_dir: PathBuf::from("/var/lib/vmscan"),
        }
    }

    #[test]
    fn test_paths_are_deterministic() {
        let a = JobPaths::new(&storage(), "0f8fad5b-d9cb-469f-a165-70867728950e");
        let b = JobPaths::new(&storage(), "0f8fad5b-d9cb-469f-a165-70867728950e");
        assert_eq!(a, b);
    }

    #[test]
    fn test_layout_matches_base_dir() {
        let paths = JobPaths::new(&storage(), "abc123");
        assert_eq!(paths.upload, Path::new("/var/lib/vmscan/uploads/abc123.bin"));
        assert_eq!(
            paths.disk_image,
            Path::new("/var/lib/vmscan/disks/input-abc123.ext4")
        );
        assert_eq!(paths.mount_dir, Path::new("/var/lib/vmscan/mnt/input-abc123"));
        assert_eq!(paths.chroot_dir, Path::new("/var/lib/vmscan/vms/abc123"));
        assert_eq!(
            paths.api_socket,
            Path::new("/var/lib/vmscan/vms/abc123/api.sock")
        );
        assert_eq!(
            paths.scan_report,
            Path::new("/var/lib/vmscan/scan_results/abc123.json")
        );
    }

    #[test]
    fn test_tap_name_uses_id_prefix() {
        let paths = JobPaths::new(&storage(), "0f8fad5b-d9cb-469f-a165-70867728950e");
        assert_eq!(paths.tap_name, "tap-0f8fad5b");

        // short ids must not panic
        let short = JobPaths::new(&storage(), "ab");
        assert_eq!(short.tap_name, "tap-ab");
    }

    #[test]
    fn test_distinct_ids_never_collide() {
        let a = JobPaths::new(&storage(), "job-a");
        let b = JobPaths::new(&storage(), "job-b");
        assert_ne!(a.upload, b.upload);
        assert_ne!(a.disk_image, b.disk_image);
        assert_ne!(a.mount_dir, b.mount_dir);
        assert_ne!(a.api_socket, b.api_socket);
        assert_ne!(a.chroot_dir, b.chroot_dir);
        assert_ne!(a.scan_report, b.scan_report);
    }
}

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::paths::JobPaths;

/// Space consumed by ext4 metadata, journal and reserved blocks on a small
/// image; subtracted from the raw size when judging upload capacity.
const FS_OVERHEAD_MIB: u64 = 6;

/// Deadline for each external command in the pipeline.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const MOUNT_DIR_PERMISSIONS: u32 = 0o700;

/// Bytes available for the payload inside an image of the given size.
pub fn usable_capacity(image_size_mib: u64) -> u64 {
    image_size_mib.saturating_sub(FS_OVERHEAD_MIB) * 1024 * 1024
}

/// Runs an external tool to completion, mapping non-zero exit and timeouts
/// onto the error taxonomy. Shared by provisioning and TAP management.
pub(crate) async fn run_checked(tool: &'static str, cmd: &mut Command) -> Result<()> {
    let output = timeout(COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| Error::ExternalTool {
            tool,
            detail: "timed out".to_string(),
        })?
        .map_err(|e| Error::ExternalTool {
            tool,
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::ExternalTool {
            tool,
            detail: format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Builds the per-job block image: allocate, format, loop-mount, stage the
/// upload as `input.bin`, sync, unmount.
///
/// The pipeline is not atomic. Every intermediate artifact is named by
/// `JobPaths`, so a failure at any step leaves garbage the cleanup planner
/// can collect. After a successful run the image is self-contained and is
/// treated as read-only for the rest of the job.
pub struct DiskProvisioner {
    image_size_mib: u64,
}

impl DiskProvisioner {
    pub fn new(image_size_mib: u64) -> Self {
        Self { image_size_mib }
    }

    pub fn capacity(&self) -> u64 {
        usable_capacity(self.image_size_mib)
    }

    /// Whether an upload of this size fits the image after overhead.
    pub fn accepts(&self, upload_size: u64) -> bool {
        upload_size <= self.capacity()
    }

    pub async fn provision(&self, paths: &JobPaths, upload_size: u64) -> Result<()> {
        if !self.accepts(upload_size) {
            return Err(Error::CapacityExceeded {
                size: upload_size,
                capacity: self.capacity(),
            });
        }

        self.allocate(&paths.disk_image).await?;
        self.format(&paths.disk_image).await?;
        self.mount(&paths.disk_image, &paths.mount_dir).await?;

        let staged = match self.stage_input(paths).await {
            Ok(()) => self.flush().await,
            err => err,
        };
        // the image must not stay mounted even when staging failed
        let unmounted = self.unmount(&paths.mount_dir).await;

        staged?;
        unmounted?;

        log::info!(
            "Created disk image {} ({} MiB)",
            paths.disk_image.display(),
            self.image_size_mib
        );
        Ok(())
    }

    async fn allocate(&self, disk_image: &Path) -> Result<()> {
        run_checked(
            "dd",
            Command::new("dd")
                .arg("if=/dev/zero")
                .arg(format!("of={}", disk_image.display()))
                .arg("bs=1M")
                .arg(format!("count={}", self.image_size_mib))
                .arg("status=none"),
        )
        .await
    }

    async fn format(&self, disk_image: &Path) -> Result<()> {
        run_checked(
            "mkfs.ext4",
            Command::new("mkfs.ext4").arg("-F").arg("-q").arg(disk_image),
        )
        .await
    }

    async fn mount(&self, disk_image: &Path, mount_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(mount_dir).await?;
        tokio::fs::set_permissions(
            mount_dir,
            std::fs::Permissions::from_mode(MOUNT_DIR_PERMISSIONS),
        )
        .await?;

        run_checked(
            "mount",
            Command::new("mount")
                .arg("-o")
                .arg("loop")
                .arg(disk_image)
                .arg(mount_dir),
        )
        .await
    }

    async fn stage_input(&self, paths: &JobPaths) -> Result<()> {
        let destination = paths.mount_dir.join("input.bin");
        match tokio::fs::copy(&paths.upload, &destination).await {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => Err(Error::CapacityExceeded {
                size: tokio::fs::metadata(&paths.upload)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0),
                capacity: self.capacity(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self) -> Result<()> {
        run_checked("sync", &mut Command::new("sync")).await
    }

    async fn unmount(&self, mount_dir: &Path) -> Result<()> {
        run_checked("umount", Command::new("umount").arg(mount_dir)).await
    }
}

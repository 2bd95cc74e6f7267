use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use sqlx::SqlitePool;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::api::{ApiClient, VmAction};
use crate::config::VmConfig;
use crate::database::{self as db, VmState};
use crate::disk::run_checked;
use crate::error::{Error, Result};
use crate::paths::JobPaths;

const SOCKET_WAIT_BUDGET: Duration = Duration::from_secs(5);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a guest gets to act on ctrl-alt-del before the child is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

struct VmHandle {
    paths: JobPaths,
    stop: CancellationToken,
    watcher: JoinHandle<()>,
}

/// Live hypervisor children, at most one per job id.
#[derive(Default, Clone)]
pub struct VmRegistry {
    inner: Arc<Mutex<HashMap<String, VmHandle>>>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(job_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    fn insert(&self, job_id: &str, handle: VmHandle) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(job_id) {
            // the watcher will reap the extra child once the grace runs out
            handle.stop.cancel();
            return Err(Error::InvalidState {
                id: job_id.to_string(),
                state: "running".to_string(),
                expected: "no live hypervisor",
            });
        }
        map.insert(job_id.to_string(), handle);
        Ok(())
    }

    fn take(&self, job_id: &str) -> Option<VmHandle> {
        self.inner.lock().unwrap().remove(job_id)
    }

    fn discard(&self, job_id: &str) {
        self.inner.lock().unwrap().remove(job_id);
    }
}

/// Owns the hypervisor child process of each running job: spawns it (jailed
/// when a jailer is configured), drives the control API to a started guest,
/// and watches for exit.
pub struct Supervisor {
    config: VmConfig,
    pool: Arc<SqlitePool>,
    registry: VmRegistry,
}

impl Supervisor {
    pub fn new(config: VmConfig, pool: Arc<SqlitePool>) -> Self {
        Self {
            config,
            pool,
            registry: VmRegistry::new(),
        }
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    /// Brings up the micro-VM for a provisioned job and adopts the child.
    ///
    /// On any failure the child is reaped and the VM-scoped artifacts are
    /// removed again; the caller decides what happens to the job row.
    pub async fn launch(&self, job_id: &str, paths: &JobPaths, enable_network: bool) -> Result<()> {
        if self.registry.contains(job_id) {
            return Err(Error::InvalidState {
                id: job_id.to_string(),
                state: "running".to_string(),
                expected: "no live hypervisor",
            });
        }

        tokio::fs::create_dir_all(&paths.chroot_dir).await?;

        if enable_network {
            create_tap(&paths.tap_name).await?;
        }

        let mut child = match self.spawn_hypervisor(job_id, paths) {
            Ok(child) => child,
            Err(e) => {
                teardown_vm_artifacts(paths, enable_network).await;
                return Err(e);
            }
        };

        if let Err(e) = self.bring_up(paths, enable_network).await {
            log::error!("job {job_id}: VM bring-up failed: {e}");
            let _ = child.start_kill();
            let _ = child.wait().await;
            teardown_vm_artifacts(paths, enable_network).await;
            return Err(e);
        }

        // record `running` before the watcher exists, so the exit
        // notification can never observe an earlier state
        if let Err(e) = db::update_vm_state(&self.pool, job_id, VmState::Running).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            teardown_vm_artifacts(paths, enable_network).await;
            return Err(e);
        }

        let stop = CancellationToken::new();
        let watcher = tokio::spawn(watch(
            child,
            stop.clone(),
            job_id.to_string(),
            paths.clone(),
            enable_network,
            self.pool.clone(),
            self.registry.clone(),
        ));
        let handle = VmHandle {
            paths: paths.clone(),
            stop,
            watcher,
        };
        if let Err(e) = self.registry.insert(job_id, handle) {
            log::error!("job {job_id}: duplicate hypervisor detected, reaping the newcomer");
            return Err(e);
        }

        log::info!("job {job_id}: VM started");
        Ok(())
    }

    /// Configuration sequence: machine, boot source and root drive strictly
    /// precede the start action; the input drive and NIC just have to land
    /// somewhere before it.
    async fn bring_up(&self, paths: &JobPaths, enable_network: bool) -> Result<()> {
        wait_for_socket(&paths.api_socket).await?;

        let api = ApiClient::new(&paths.api_socket);
        api.configure_machine(self.config.vcpus, self.config.mem_size_mib)
            .await?;
        api.set_boot_source(&self.config.kernel_path, &self.config.boot_args)
            .await?;
        // both drives read-only: the guest gets no writable host surface
        api.attach_drive("rootfs", &self.config.rootfs_path, true, true)
            .await?;
        api.attach_drive("input_drive", &paths.disk_image, false, true)
            .await?;
        if enable_network {
            api.attach_nic("eth0", &paths.tap_name, &random_guest_mac())
                .await?;
        }
        api.action(VmAction::InstanceStart).await
    }

    fn spawn_hypervisor(&self, job_id: &str, paths: &JobPaths) -> Result<Child> {
        let mut cmd = match &self.config.jailer_bin {
            Some(jailer) => {
                let chroot_base = paths.chroot_dir.parent().unwrap_or(Path::new("/"));
                let mut cmd = Command::new(jailer);
                cmd.arg("--id")
                    .arg(job_id)
                    .arg("--exec-file")
                    .arg(&self.config.firecracker_bin)
                    .arg("--uid")
                    .arg(self.config.uid.to_string())
                    .arg("--gid")
                    .arg(self.config.gid.to_string())
                    .arg("--chroot-base-dir")
                    .arg(chroot_base)
                    .arg("--")
                    .arg("--api-sock")
                    .arg(&paths.api_socket);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.config.firecracker_bin);
                cmd.arg("--api-sock").arg(&paths.api_socket);
                cmd
            }
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::ExternalTool {
                tool: "firecracker",
                detail: format!("failed to spawn hypervisor for job {job_id}: {e}"),
            })
    }

    /// Asks the guest to shut down, then reaps the child. Returns whether a
    /// hypervisor was actually running for this job.
    pub async fn stop(&self, job_id: &str) -> bool {
        let Some(handle) = self.registry.take(job_id) else {
            return false;
        };

        let api = ApiClient::new(&handle.paths.api_socket);
        if let Err(e) = api.action(VmAction::SendCtrlAltDel).await {
            log::debug!("job {job_id}: ctrl-alt-del not delivered: {e}");
        } else {
            log::info!("job {job_id}: shutdown signal sent to VM");
        }

        handle.stop.cancel();
        if let Err(e) = handle.watcher.await {
            log::error!("job {job_id}: VM watcher task failed: {e}");
        }
        true
    }

    /// Stops every running VM; used on process shutdown.
    pub async fn shutdown_all(&self) {
        for job_id in self.registry.ids() {
            self.stop(&job_id).await;
        }
    }
}

/// Waits for the child to exit, or kills it after the grace period once the
/// stop token fires. Afterwards the job advances to `exited` and the
/// VM-scoped artifacts (TAP, socket, chroot) are removed.
async fn watch(
    mut child: Child,
    stop: CancellationToken,
    job_id: String,
    paths: JobPaths,
    had_network: bool,
    pool: Arc<SqlitePool>,
    registry: VmRegistry,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => log::info!("job {job_id}: VM exited with {status}"),
            Err(e) => log::error!("job {job_id}: failed waiting for VM: {e}"),
        },
        _ = stop.cancelled() => {
            if timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                log::warn!("job {job_id}: VM ignored shutdown, killing");
                if child.start_kill().is_ok() {
                    let _ = child.wait().await;
                }
            }
        }
    }

    match db::update_vm_state(&pool, &job_id, VmState::Exited).await {
        Ok(()) => {}
        // the row may already be gone when a delete raced the exit
        Err(Error::NotFound(_)) => {}
        Err(e) => log::error!("job {job_id}: failed to record VM exit: {e}"),
    }

    teardown_vm_artifacts(&paths, had_network).await;
    registry.discard(&job_id);
}

async fn wait_for_socket(socket: &Path) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SOCKET_WAIT_BUDGET;
    loop {
        if tokio::fs::try_exists(socket).await.unwrap_or(false) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::SupervisorTimeout(format!(
                "control socket {} never appeared",
                socket.display()
            )));
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
}

/// Removes what only exists while a hypervisor does: the TAP device, the
/// control socket, and the chroot tree. All best-effort and idempotent.
async fn teardown_vm_artifacts(paths: &JobPaths, had_network: bool) {
    if had_network {
        delete_tap(&paths.tap_name).await;
    }
    if let Err(e) = tokio::fs::remove_file(&paths.api_socket).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("socket removal failed: {e}");
        }
    }
    if let Err(e) = tokio::fs::remove_dir_all(&paths.chroot_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("chroot removal failed: {e}");
        }
    }
}

async fn create_tap(tap_name: &str) -> Result<()> {
    run_checked(
        "ip",
        Command::new("ip")
            .args(["tuntap", "add", tap_name, "mode", "tap"]),
    )
    .await?;
    run_checked("ip", Command::new("ip").args(["link", "set", tap_name, "up"])).await
}

async fn delete_tap(tap_name: &str) {
    if let Err(e) = run_checked("ip", Command::new("ip").args(["link", "del", tap_name])).await {
        log::debug!("TAP {tap_name} removal: {e}");
    }
}

/// Locally-administered MAC in the AA:FC:… range used for guest NICs.
fn random_guest_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "AA:FC:{:02X}:{:02X}:{:02X}:{:02X}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_mac_shape() {
        for _ in 0..32 {
            let mac = random_guest_mac();
            assert_eq!(mac.len(), 17);
            assert!(mac.starts_with("AA:FC:"));
            assert_eq!(mac.split(':').count(), 6);
            for octet in mac.split(':') {
                assert_eq!(octet.len(), 2);
                assert!(u8::from_str_radix(octet, 16).is_ok());
            }
        }
    }

    #[tokio::test]
    async fn test_wait_for_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never.sock");
        let started = std::time::Instant::now();
        let err = wait_for_socket(&missing).await.unwrap_err();
        assert!(matches!(err, Error::SupervisorTimeout(_)));
        // bounded by the budget plus one poll interval of slack
        assert!(started.elapsed() < SOCKET_WAIT_BUDGET + Duration::from_secs(2));
        assert!(started.elapsed() >= SOCKET_WAIT_BUDGET);
    }

    #[tokio::test]
    async fn test_wait_for_socket_finds_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        std::fs::write(&socket, b"").unwrap();
        wait_for_socket(&socket).await.unwrap();
    }
}

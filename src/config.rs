use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "vmscan", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file; defaults apply when omitted
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Whether to flush the existing job store
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Enable debug logging
    #[arg(long = "verbose", short = 'v', default_value_t = false)]
    pub verbose: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn read_config(&self) -> std::io::Result<Config> {
        match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader).map_err(|e| e.into())
            }
            None => Ok(Config::default()),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub disk: DiskConfig,
    pub vm: VmConfig,
    pub scanner: ScannerConfig,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of every on-disk artifact: uploads, disks, mounts, chroots,
    /// scan reports, rules, and the job store itself.
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/vmscan"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DiskConfig {
    /// Size of the per-job input image in MiB; overridable per submission
    pub image_size_mib: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self { image_size_mib: 50 }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct VmConfig {
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub firecracker_bin: PathBuf,
    /// When set, the hypervisor is spawned under this jailer binary;
    /// otherwise it runs unjailed.
    pub jailer_bin: Option<PathBuf>,
    pub uid: u32,
    pub gid: u32,
    pub vcpus: u32,
    pub mem_size_mib: u32,
    pub boot_args: String,
    /// Default NIC policy; each run request may override it
    pub enable_network: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/var/lib/vmscan/vmlinux.bin"),
            rootfs_path: PathBuf::from("/var/lib/vmscan/rootfs.ext4"),
            firecracker_bin: PathBuf::from("firecracker"),
            jailer_bin: None,
            uid: 1000,
            gid: 1000,
            vcpus: 1,
            mem_size_mib: 512,
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            enable_network: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ScannerConfig {
    pub yara_bin: PathBuf,
    /// Per rule-file scan deadline in seconds
    pub timeout_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            yara_bin: PathBuf::from("yara"),
            timeout_secs: 30,
        }
    }
}

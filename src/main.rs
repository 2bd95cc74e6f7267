use std::process::Command;
use std::sync::Arc;

use clap::Parser;

use vmscan::config::{CliArgs, Config};
use vmscan::database as db;
use vmscan::orchestrator::Orchestrator;
use vmscan::paths;
use vmscan::web_server::build_server;

/// Check if a command exists in the system PATH
fn check_command_exists(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Loop mounts and TAP devices need privilege; warn early instead of failing
/// on the first submission.
fn check_running_user() {
    if unsafe { libc::getuid() } != 0 {
        log::warn!("Not running as root: loop mounts and TAP creation will likely fail.");
        log::warn!("Grant the service the required privileges or run it as root.");
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = CliArgs::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(log_level));

    for required in ["dd", "mkfs.ext4", "mount", "umount"] {
        if !check_command_exists(required) {
            log::error!("Required command '{required}' not found. Please install it.");
            std::process::exit(1);
        }
    }
    if !check_command_exists("yara") {
        log::warn!("'yara' not found in PATH - static scans will fail until it is installed.");
    }

    check_running_user();

    let config: Config = cli.read_config().unwrap_or_else(|e| {
        log::error!("Failed to read configuration: {e}");
        std::process::exit(1);
    });

    if !check_command_exists(&config.vm.firecracker_bin.to_string_lossy()) {
        log::warn!(
            "Hypervisor binary '{}' not found - VM detonation will fail until it is installed.",
            config.vm.firecracker_bin.display()
        );
    }

    std::fs::create_dir_all(&config.storage.base_dir).unwrap_or_else(|e| {
        log::error!(
            "Failed to create base directory {}: {e}",
            config.storage.base_dir.display()
        );
        std::process::exit(1);
    });

    let db_path = paths::db_path(&config.storage);
    if cli.flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path).await.unwrap_or_else(|e| {
        log::error!("Failed to initialize job store: {e}");
        std::process::exit(1);
    });

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), Arc::new(db_pool)));
    orchestrator.init().await.unwrap_or_else(|e| {
        log::error!("Failed to initialize directory layout and scanner rules: {e}");
        std::process::exit(1);
    });

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(config.server, orchestrator.clone()).unwrap_or_else(|e| {
        log::error!("Failed to start web server: {e}");
        std::process::exit(1);
    });

    log::info!("HTTP server listening...");
    log::info!("Endpoints:");
    log::info!("  POST   /upload              - Upload file for scanning");
    log::info!("  POST   /vm/scan/{{jobID}}     - Start VM to detonate uploaded file");
    log::info!("  GET    /jobs/{{jobID}}        - Get job status");
    log::info!("  GET    /jobs                - List jobs");
    log::info!("  DELETE /jobs/{{jobID}}        - Cleanup job resources");
    log::info!("  POST   /scan/{{jobID}}        - Run YARA scan on uploaded file");
    log::info!("  GET    /scan/{{jobID}}        - Get YARA scan results");
    log::info!("  GET    /stats               - Job statistics");

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {res_server:?}");
        }
    }

    // 1. Stop accepting requests
    server_handle.stop(true).await;

    // 2. Stop every running VM and reap its watcher
    orchestrator.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

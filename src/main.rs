//! Main entry point for the GPU fan daemon

use anyhow::{Context, Result};
use clap::Parser;
use gpu_fan_daemon::{
    args::{detached_args, Args},
    backend::{nvml::NvmlBackend, sim::SimulatedBackend, DeviceBackend},
    config::DaemonConfig,
    daemon::{FanDaemon, ShutdownGuard},
    inspect, logging,
};
use log::{error, info};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Set in the environment of the detached child
const DETACHED_ENV: &str = "GPU_FAN_DAEMON_DETACHED";

fn open_backend(simulate: Option<u32>) -> Result<Arc<dyn DeviceBackend>> {
    Ok(match simulate {
        Some(count) => {
            info!("Using {} simulated GPU(s)", count);
            Arc::new(SimulatedBackend::new(count))
        }
        None => Arc::new(NvmlBackend::init().context("failed to initialize NVML")?),
    })
}

/// Re-launch this binary in the background with `--foreground` appended
fn detach() -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate executable")?;
    let child = Command::new(exe)
        .args(detached_args(std::env::args_os().skip(1)))
        .env(DETACHED_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("failed to start background process")?;
    info!("Daemon started in background (pid {})", child.id());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Print version and build metadata for binary identity verification
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let git_desc = option_env!("GIT_DESC").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    eprintln!(
        "gpu-fan-daemon v{} (git {} / {}) built {}",
        pkg_version, git_hash, git_desc, build_time
    );
    let args = Args::parse();

    if args.list || args.restore {
        logging::setup(None, args.verbose)?;
        let backend = open_backend(args.simulate)?;
        if args.list {
            inspect::list_devices(backend.as_ref(), &mut std::io::stdout().lock())?;
        } else {
            ShutdownGuard::new().restore(backend.as_ref());
        }
        return Ok(());
    }

    let config = DaemonConfig::load_from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    logging::setup(config.logging.as_ref(), args.verbose)?;

    let foreground = args.foreground.unwrap_or(config.foreground);
    if !foreground && std::env::var_os(DETACHED_ENV).is_none() {
        return detach();
    }

    let backend = match open_backend(args.simulate) {
        Ok(backend) => backend,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let exit = FanDaemon::new(Arc::new(config), backend).run().await?;
    info!("Daemon exiting with code {}", exit.exit_code());
    std::process::exit(exit.exit_code());
}

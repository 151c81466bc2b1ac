//! Command line argument parsing for the GPU fan daemon

use crate::config::DEFAULT_CONFIG_PATH;
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

/// GPU fan daemon
///
/// Regulates GPU fan speed from temperature, with a fan curve or a PID loop
/// per card, and hands the fans back to the driver on exit.
#[derive(Parser, Debug)]
#[command(name = "gpu-fan-daemon")]
#[command(about = "Temperature-driven GPU fan control daemon")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Run in foreground; overrides the configuration file when given
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub foreground: Option<bool>,

    /// List GPUs and exit
    #[arg(long, conflicts_with = "restore")]
    pub list: bool,

    /// Restore default fan control on all GPUs and exit
    #[arg(long)]
    pub restore: bool,

    /// Use N simulated GPUs instead of NVML
    #[arg(long, value_name = "N")]
    pub simulate: Option<u32>,

    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Arguments for the detached child: the parent's own arguments with any
/// `--foreground` setting replaced by a plain `--foreground`.
pub fn detached_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut kept = Vec::new();
    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--foreground") => {
                if matches!(args.peek().and_then(|next| next.to_str()), Some("true" | "false")) {
                    args.next();
                }
            }
            Some(flag) if flag.starts_with("--foreground=") => {}
            _ => kept.push(arg),
        }
    }
    kept.push(OsString::from("--foreground"));
    kept
}

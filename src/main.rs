//! OTA upload hook for PlatformIO firmware builds.
//!
//! Usage:
//!   ota-publish .pio/build/light/firmware.bin --env light
//!   ota-publish firmware.bin -e light --url http://localhost:1880 -v

mod config;
mod error;
mod hook;
mod upload;

use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{debug, error};

use crate::config::Overrides;
use crate::hook::BuildContext;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "ota-publish", about = "Push a firmware image to the OTA store")]
struct Cli {
    /// Built firmware image ($SOURCE).
    firmware: PathBuf,

    /// Build environment that produced the image.
    #[arg(short = 'e', long = "env", env = "PIOENV")]
    env: String,

    /// Project configuration file, relative to the project directory.
    #[arg(short = 'c', long = "config", default_value = "platformio.ini")]
    config: PathBuf,

    /// Project directory.
    #[arg(long, env = "PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    /// OTA store base URL (scheme://host:port); overrides the project file.
    #[arg(long)]
    url: Option<String>,

    /// Device to notify; overrides `mqtt_device` from the project file.
    #[arg(long)]
    device: Option<String>,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(cli.verbose) {
        eprintln!("ota-publish: {e}");
    }

    let config_path = cli.project_dir.join(&cli.config);
    let project = match config::load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ota-publish: config error: {e}");
            process::exit(1);
        }
    };
    let overrides = Overrides { url: cli.url, device: cli.device };
    let settings = match project.ota_settings(&cli.env, &overrides) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ota-publish: config error: {}", e.diagnostic());
            process::exit(1);
        }
    };
    debug!("settings for env {}: {settings:?}", cli.env);

    let ctx = BuildContext { firmware: cli.firmware, env: cli.env };

    let result = match reqwest::Client::builder().build() {
        Ok(http) => {
            let today = chrono::Local::now().date_naive();
            hook::publish_firmware(&http, &ctx, &settings, today, &mut io::stdout()).await
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        error!("upload of {} for env {} failed", ctx.firmware.display(), ctx.env);
        eprintln!("Failed to submit package: {}", e.diagnostic());
        process::exit(1);
    }
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("set_logger: {e}"))
}

use anyhow::Result;
use sysinfo::System;
use tracing::{debug, info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;
mod config;
mod render;
mod resolver;
mod utils;

use crate::cli::{CliAction, Presentation};
use crate::config::{load_config, EffectiveConfig};
use crate::resolver::GpuResolver;
use crate::utils::{format_bytes, runner::SystemRunner};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let presentation = match crate::cli::parse_args() {
        CliAction::PrintVersion => {
            crate::cli::print_version();
            return Ok(());
        }
        CliAction::InitConfig => {
            crate::cli::init_config_file();
            return Ok(());
        }
        CliAction::Show(p) => p,
    };

    let cfg = load_config().unwrap_or_else(|e| {
        eprintln!("Ignoring config file: {e:#}");
        EffectiveConfig::default()
    });
    let _log_guard = init_logging(&cfg);
    for pattern in &cfg.invalid_patterns {
        warn!(%pattern, "Ignoring invalid skip_adapters pattern");
    }
    log_host_summary();

    let resolver = GpuResolver::from_config(SystemRunner::new(cfg.timeout), &cfg);
    let reading = resolver.resolve().await;
    debug!(source = reading.source().label(), ?presentation, "Rendering reading");

    match presentation {
        Presentation::Popup => crate::render::show_popup(&reading),
        Presentation::Console { pause } => {
            crate::render::print_console(&reading);
            if pause && cfg.pause_on_exit {
                if let Err(e) = crate::render::wait_for_enter(std::io::stdin().lock(), std::io::stdout()) {
                    debug!(?e, "stdin closed before Enter");
                }
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so they never interleave with the report on stdout.
fn init_logging(cfg: &EffectiveConfig) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr).compact();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    let registry = tracing_subscriber::registry().with(env_filter).with(stderr_layer);

    if !cfg.log_to_file {
        registry.init();
        return None;
    }

    match std::fs::create_dir_all(&cfg.log_dir) {
        Ok(()) => {
            if cfg.clean_log_on_start {
                let log_path = cfg.log_dir.join("latest.log");
                if let Ok(f) =
                    std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&log_path)
                {
                    drop(f);
                }
            }
            let file_appender = rolling::never(&cfg.log_dir, "latest.log");
            let (file_nb, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_ansi(false).with_target(false).with_writer(file_nb).compact();
            registry.with(file_layer).init();
            Some(guard)
        }
        Err(e) => {
            registry.init();
            warn!(dir = %cfg.log_dir.display(), ?e, "File logging disabled");
            None
        }
    }
}

fn log_host_summary() {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();
    let os = System::name().unwrap_or_else(|| "Unknown OS".into());
    let os_ver = System::os_version().unwrap_or_default();
    let cpu_brand = sys.cpus().first().map(|c| c.brand().to_string()).unwrap_or_else(|| "Unknown CPU".into());
    let total_mem = sys.total_memory();
    if total_mem == 0 {
        warn!("Unable to determine RAM size");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        os = %format!("{} {}", os, os_ver),
        cpu = %cpu_brand,
        ram = %format_bytes(total_mem),
        "ohmygpu starting"
    );
}

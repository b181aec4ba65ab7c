//! Reference host for the cadence scheduling core.
//!
//! Plays the role of a frame-based engine: it owns the phase registry,
//! publishes frame time, and dispatches the standard phases once per tick.
//! A small demonstration workload runs on top until the tick bound is
//! reached or Ctrl-C is pressed.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `cadence-config.yaml` (or `CADENCE_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Register the standard phases and apply the default phase and time scale
//! 4. Install the Ctrl-C handler
//! 5. Install the demo workload
//! 6. Run the tick driver
//! 7. Dispose the workload and log the result

mod demo;
mod error;

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use cadence_core::CancellationToken;
use cadence_core::config::{CadenceConfig, LoggingConfig};
use cadence_core::driver::TickDriver;
use cadence_core::phase::{PhaseError, PhaseRegistry};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::HostError;

/// Application entry point for the reference host.
///
/// The scheduling core is single-threaded, so the host runs on a
/// current-thread runtime.
///
/// # Errors
///
/// Returns an error if any initialization step or the tick loop fails.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), HostError> {
    // 1. Load configuration.
    let (config, config_found) = load_config()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!("cadence-host starting");
    if !config_found {
        info!("Config file not found, using defaults");
    }
    info!(
        tick_interval_ms = config.host.tick_interval_ms,
        max_ticks = config.host.max_ticks,
        time_scale = config.host.time_scale,
        default_phase = config.host.default_phase,
        "Configuration loaded"
    );

    // 3. Build the registry.
    let registry = Rc::new(PhaseRegistry::with_standard_phases());
    let default_phase = config.host.default_phase_id();
    if !registry.is_registered(&default_phase) {
        return Err(PhaseError::UnknownPhase {
            phase: default_phase,
        }
        .into());
    }
    registry.set_default(Some(default_phase));
    registry.frame_clock().set_time_scale(config.host.time_scale)?;
    info!(phases = registry.phases().len(), "Phase registry initialized");

    // 4. Cancel on Ctrl-C.
    let shutdown = CancellationToken::new();
    spawn_ctrl_c_handler(shutdown.clone());

    // 5. Install the workload.
    let demo = demo::install(&registry, &config.demo, &shutdown)?;

    // 6. Run.
    let driver = TickDriver::new(Duration::from_millis(config.host.tick_interval_ms))
        .with_max_ticks(config.host.max_ticks);
    let result = driver.run(&registry, &shutdown).await;

    // 7. Clean up regardless of how the loop ended.
    demo.finish();
    let summary = result?;
    info!(
        ticks = summary.ticks,
        end_reason = %summary.end_reason,
        frames = registry.frame_clock().frame(),
        "cadence-host exiting"
    );
    Ok(())
}

/// Load configuration from `CADENCE_CONFIG` or `cadence-config.yaml`.
///
/// Falls back to defaults when the file does not exist. Returns whether a
/// file was found, so the caller can log it once tracing is up.
fn load_config() -> Result<(CadenceConfig, bool), HostError> {
    let config_path = std::env::var_os("CADENCE_CONFIG")
        .map_or_else(|| PathBuf::from("cadence-config.yaml"), PathBuf::from);
    if config_path.exists() {
        let config = CadenceConfig::from_file(&config_path)?;
        Ok((config, true))
    } else {
        Ok((CadenceConfig::parse("")?, false))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn spawn_ctrl_c_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
            Err(error) => warn!(error = %error, "failed to listen for Ctrl-C"),
        }
    });
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanctl-daemon: system service that owns hwmon writes, runs the curve
//! engine, performs diagnostic verifications, and accepts commands from
//! clients over a Unix domain socket.

use clap::Parser;
use laptop_fan_control::Error;
use laptop_fan_control::cancel::CancelRegistry;
use laptop_fan_control::config::{self, ConfigFile};
use laptop_fan_control::curve::FanCurve;
use laptop_fan_control::fan_loop::{FanControlLoop, TickOutcome};
use laptop_fan_control::hwmon::{self, HwmonBackend};
use laptop_fan_control::mode_select;
use laptop_fan_control::preset::{Preset, PresetStore};
use laptop_fan_control::protocol::{self, FanStateInfo, Request, Response};
use laptop_fan_control::verify::{self, VerificationService};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fanctl-daemon", about = "Laptop fan control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the socket path.
    #[arg(short, long)]
    socket: Option<String>,

    /// Override the hwmon sysfs root.
    #[arg(long, default_value = hwmon::HWMON_ROOT)]
    hwmon_root: String,
}

// ---------------------------------------------------------------------------
// Shared daemon state
// ---------------------------------------------------------------------------

struct Daemon {
    store: PresetStore,
    fan_loop: Arc<FanControlLoop>,
    verifier: VerificationService,
    /// Running verifications/samplings, by fan index.
    cancels: CancelRegistry,
}

type SharedDaemon = Arc<Daemon>;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));
    let cfg = config::load_config(&config_path).unwrap_or_else(|e| {
        log::warn!("Could not load config: {e}, using defaults");
        config::Config::default()
    });

    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| cfg.daemon.socket_path.clone());

    // Hardware
    let hardware = Arc::new(build_backend(Path::new(&cli.hwmon_root), &cfg));

    // Presets
    let store = PresetStore::new(Arc::new(ConfigFile::new(&config_path)));
    if let Err(e) = store.load_from_persistent_store() {
        log::error!("Failed to load presets: {e}");
    }
    let mut preset_events = store.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = preset_events.recv().await {
            log::debug!("Preset change: {event:?}");
        }
    });

    // Control loop, starting from the configured preset
    let fan_loop = Arc::new(FanControlLoop::new(hardware.clone()));
    let initial = cfg
        .daemon
        .active_preset
        .as_deref()
        .and_then(|name| {
            let found = store.get(name);
            if found.is_none() {
                log::warn!("Configured preset '{name}' not found, using Auto");
            }
            found
        })
        .unwrap_or_else(Preset::auto);
    fan_loop.apply_preset(&initial);

    let verifier = VerificationService::new(hardware.clone(), cfg.verification.clone());
    if !verifier.is_available() {
        log::warn!("No fan with a tachometer found; verification disabled");
    }

    let daemon: SharedDaemon = Arc::new(Daemon {
        store,
        fan_loop: fan_loop.clone(),
        verifier,
        cancels: CancelRegistry::new(),
    });

    // Clean up old socket file
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    // Make socket accessible to non-root users
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o666);
        std::fs::set_permissions(&socket_path, perms)?;
    }

    log::info!("Listening on {socket_path}");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Signal handler
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received shutdown signal");
        shutdown_tx.send_replace(true);
    });

    // Curve engine loop
    let curve_task = tokio::spawn(
        fan_loop
            .clone()
            .run(cfg.daemon.poll_interval(), shutdown_rx.clone()),
    );

    // Accept client connections
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tokio::spawn(handle_client(stream, daemon.clone()));
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                log::info!("Daemon shutting down");
                break;
            }
        }
    }

    // The curve engine must be stopped before fans are handed back.
    curve_task.await.ok();
    if cfg.daemon.restore_on_exit {
        hardware.restore_all_automatic();
        log::info!("Restored all fans to automatic control");
    }

    // Cleanup socket
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

fn build_backend(root: &Path, cfg: &config::Config) -> HwmonBackend {
    let fans = hwmon::discover_fans(root).unwrap_or_else(|e| {
        log::error!("Failed to discover fans: {e}");
        Vec::new()
    });
    let sensors = hwmon::discover_temp_sensors(root).unwrap_or_else(|e| {
        log::error!("Failed to discover temp sensors: {e}");
        Vec::new()
    });

    log::info!(
        "Discovered {} fan(s) and {} temp sensor(s)",
        fans.len(),
        sensors.len()
    );

    let bindings = if cfg.channels.is_empty() {
        hwmon::default_bindings(&fans, &sensors)
    } else {
        cfg.channels.clone()
    };

    HwmonBackend::from_bindings(&bindings, &fans, &sensors).unwrap_or_else(|e| {
        log::error!("Invalid channel configuration: {e}; running without fan channels");
        HwmonBackend::empty()
    })
}

// ---------------------------------------------------------------------------
// Client connection handler
// ---------------------------------------------------------------------------

async fn handle_client(stream: UnixStream, daemon: SharedDaemon) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let response = match protocol::decode::<Request>(&line) {
            Ok(req) => process_request(req, &daemon).await,
            Err(e) => Response::Error {
                message: format!("Invalid request: {e}"),
            },
        };

        let encoded = match protocol::encode(&response) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Failed to encode response: {e}");
                continue;
            }
        };

        if writer.write_all(encoded.as_bytes()).await.is_err() {
            break; // Client disconnected
        }
    }
}

async fn process_request(req: Request, daemon: &Daemon) -> Response {
    match req {
        Request::GetStatus => {
            let snapshot = daemon.fan_loop.snapshot();
            let fans = (0..snapshot.channels.len())
                .map(|fan_index| FanStateInfo {
                    fan_index,
                    state: daemon.verifier.get_current_fan_state(fan_index).ok(),
                })
                .collect();
            Response::Status {
                snapshot,
                fans,
                verification_available: daemon.verifier.is_available(),
            }
        }

        Request::ListPresets => Response::Presets {
            presets: daemon.store.list_presets(),
        },

        Request::ApplyPreset { name } => match daemon.store.get(&name) {
            Some(preset) => {
                let outcome = daemon.fan_loop.apply_preset(&preset);
                ok(applied_message(&format!("preset '{}'", preset.name), outcome))
            }
            None => error(Error::UnknownPreset(name)),
        },

        Request::ApplyFanMode { name } => {
            let (resolved, outcome) =
                mode_select::apply_fan_mode(&daemon.store, &daemon.fan_loop, &name);
            ok(applied_message(&format!("preset '{}'", resolved.preset.name), outcome))
        }

        Request::ApplyCustomCurve { points } => match daemon.fan_loop.apply_custom_curve(points) {
            Ok(outcome) => ok(applied_message("custom curve", outcome)),
            Err(e) => error(e),
        },

        Request::UpdateLiveCurve { points } => match daemon.fan_loop.update_live_curve(points) {
            Ok(outcome) => ok(applied_message("live curve", outcome)),
            Err(e) => error(e),
        },

        Request::SavePreset { name, mode } => {
            let result = FanCurve::new(daemon.fan_loop.snapshot().live_curve)
                .and_then(|curve| daemon.store.save(Preset::new(name.clone(), mode, curve)));
            match result {
                Ok(()) => ok(format!("Preset '{name}' saved")),
                Err(e) => error(e),
            }
        }

        Request::DeletePreset { name } => match daemon.store.delete(&name) {
            Ok(true) => ok(format!("Deleted preset '{name}'")),
            Ok(false) => error(Error::UnknownPreset(name)),
            Err(e) => error(e),
        },

        Request::ImportPresets { path } => match daemon.store.import_file(Path::new(&path)) {
            Ok(count) => ok(format!("Imported {count} preset(s) from {path}")),
            Err(e) => error(e),
        },

        Request::ExportPresets { path } => match daemon.store.export_file(Path::new(&path)) {
            Ok(count) => ok(format!("Exported {count} preset(s) to {path}")),
            Err(e) => error(e),
        },

        Request::GetFanState { fan_index } => {
            match daemon.verifier.get_current_fan_state(fan_index) {
                Ok(state) => Response::FanState { fan_index, state },
                Err(e) => error(e),
            }
        }

        Request::SampleRpm {
            fan_index,
            sample_count,
        } => {
            let Some((_slot, mut token)) = daemon.cancels.register(fan_index) else {
                return error(Error::VerificationBusy(fan_index));
            };
            let result = daemon
                .verifier
                .get_stable_fan_rpm(fan_index, sample_count, &mut token)
                .await;

            match result {
                Ok(sample) => Response::Rpm { fan_index, sample },
                Err(e) if e.is_cancelled() => ok(format!("Sampling on fan {fan_index} cancelled")),
                Err(e) => error(e),
            }
        }

        Request::Verify { fan_index, percent } => {
            let Some((_slot, mut token)) = daemon.cancels.register(fan_index) else {
                return error(Error::VerificationBusy(fan_index));
            };
            let result = verify::verify_with_suspension(
                &daemon.fan_loop,
                &daemon.verifier,
                fan_index,
                percent,
                &mut token,
            )
            .await;

            match result {
                Ok(result) => Response::Verification { result },
                Err(e) if e.is_cancelled() => {
                    log::info!("Verification on fan {fan_index} cancelled");
                    ok(format!("Verification on fan {fan_index} cancelled"))
                }
                Err(e) => error(e),
            }
        }

        Request::CancelVerify { fan_index } => {
            if daemon.cancels.cancel(fan_index) {
                ok(format!("Cancelling operation on fan {fan_index}"))
            } else {
                Response::Error {
                    message: format!("Nothing running on fan {fan_index}"),
                }
            }
        }

        Request::VerificationHistory => Response::History {
            results: daemon.verifier.history(),
        },
    }
}


/// Describe an apply. While diagnostic mode holds the fans the selection is
/// stored but only written on resume.
fn applied_message(what: &str, outcome: TickOutcome) -> String {
    match outcome {
        TickOutcome::Applied(_) => format!("Applied {what}"),
        TickOutcome::Suspended => {
            format!("Selected {what}; it takes effect when diagnostic mode ends")
        }
    }
}

fn ok(message: String) -> Response {
    Response::Ok { message }
}

fn error(e: Error) -> Response {
    if !e.is_validation() {
        log::error!("{e}");
    }
    Response::Error {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laptop_fan_control::fan_loop::TickReport;

    #[test]
    fn test_applied_message_reports_deferred_apply() {
        let applied = applied_message("preset 'Auto'", TickOutcome::Applied(TickReport::default()));
        assert_eq!(applied, "Applied preset 'Auto'");

        let deferred = applied_message("preset 'Max'", TickOutcome::Suspended);
        assert!(deferred.starts_with("Selected preset 'Max'"));
        assert!(deferred.contains("diagnostic mode ends"));
    }
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanctl: command-line client that sends one request to the fanctl daemon
//! over its Unix domain socket and prints the reply.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use laptop_fan_control::config;
use laptop_fan_control::curve::CurvePoint;
use laptop_fan_control::preset::ControlMode;
use laptop_fan_control::protocol::{self, Request, Response};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fanctl", about = "Laptop fan control client")]
struct Cli {
    /// Path to the daemon socket.
    #[arg(short, long, default_value = config::DEFAULT_SOCKET_PATH)]
    socket: String,

    /// Seconds to wait for a reply.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the control loop state and fan readings.
    Status,
    /// List presets.
    Presets,
    /// Apply a preset by name.
    Apply { name: String },
    /// Apply a preset by name, or the closest built-in for words like "quiet".
    Mode { name: String },
    /// Apply an unsaved curve, e.g. `custom 40:30 60:50 80:80`.
    Custom {
        #[arg(value_parser = parse_point, required = true)]
        points: Vec<CurvePoint>,
    },
    /// Edit the live curve without changing the selected preset.
    Live {
        #[arg(value_parser = parse_point, required = true)]
        points: Vec<CurvePoint>,
    },
    /// Save the live curve as a preset.
    Save {
        name: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Manual)]
        mode: ModeArg,
    },
    /// Delete a user preset.
    Delete { name: String },
    /// Import presets from a JSON document.
    Import { path: String },
    /// Export user presets to a JSON document.
    Export { path: String },
    /// Read RPM and level for a fan.
    FanState { fan_index: usize },
    /// Sample a fan's RPM.
    Sample {
        fan_index: usize,
        #[arg(long, default_value_t = 3)]
        samples: usize,
    },
    /// Command a duty directly and check the fan follows it.
    Verify { fan_index: usize, percent: i32 },
    /// Cancel a running verification or sampling.
    Cancel { fan_index: usize },
    /// Show past verification results.
    History,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Max,
    Auto,
    Manual,
}

impl From<ModeArg> for ControlMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Max => ControlMode::Max,
            ModeArg::Auto => ControlMode::Auto,
            ModeArg::Manual => ControlMode::Manual,
        }
    }
}

/// Parse `TEMP:DUTY`, e.g. `65.5:40`.
fn parse_point(s: &str) -> Result<CurvePoint, String> {
    let (temp, duty) = s
        .split_once(':')
        .ok_or_else(|| format!("expected TEMP:DUTY, got '{s}'"))?;
    let temp_c = temp
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad temperature '{temp}': {e}"))?;
    let duty = duty
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("bad duty '{duty}': {e}"))?;
    Ok(CurvePoint { temp_c, duty })
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    fn connect(path: &str, timeout: Duration) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    fn send_request(&mut self, req: &Request) -> io::Result<Response> {
        let encoded = protocol::encode(req).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
        })?;
        self.stream.write_all(encoded.as_bytes())?;
        self.stream.flush()?;

        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        protocol::decode(&line).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let request = build_request(cli.command)?;

    let mut conn = Connection::connect(&cli.socket, Duration::from_secs(cli.timeout.max(1)))
        .with_context(|| format!("Could not connect to daemon at {}", cli.socket))?;
    log::debug!("Sending {request:?}");
    let response = conn.send_request(&request)?;

    match response {
        Response::Ok { message } => println!("{message}"),
        Response::Error { message } => bail!("{message}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

fn build_request(command: Command) -> anyhow::Result<Request> {
    Ok(match command {
        Command::Status => Request::GetStatus,
        Command::Presets => Request::ListPresets,
        Command::Apply { name } => Request::ApplyPreset { name },
        Command::Mode { name } => Request::ApplyFanMode { name },
        Command::Custom { points } => Request::ApplyCustomCurve { points },
        Command::Live { points } => Request::UpdateLiveCurve { points },
        Command::Save { name, mode } => Request::SavePreset {
            name,
            mode: mode.into(),
        },
        Command::Delete { name } => Request::DeletePreset { name },
        Command::Import { path } => Request::ImportPresets {
            path: absolute(&path)?,
        },
        Command::Export { path } => Request::ExportPresets {
            path: absolute(&path)?,
        },
        Command::FanState { fan_index } => Request::GetFanState { fan_index },
        Command::Sample { fan_index, samples } => Request::SampleRpm {
            fan_index,
            sample_count: samples,
        },
        Command::Verify { fan_index, percent } => Request::Verify { fan_index, percent },
        Command::Cancel { fan_index } => Request::CancelVerify { fan_index },
        Command::History => Request::VerificationHistory,
    })
}

/// The daemon runs elsewhere, so hand it an absolute path.
fn absolute(path: &str) -> anyhow::Result<String> {
    let path = Path::new(path);
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(abs.to_string_lossy().into_owned())
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The continuous curve engine.
//!
//! On every tick each channel's temperature is read, the active mode/curve is
//! evaluated, and the resulting duty is written when it differs from the last
//! duty applied to that channel.
//!
//! Diagnostic mode suspends all loop writes. Suspension is reference counted:
//! nested enters keep the loop suspended until the matching number of exits,
//! and an exit without an enter is a logged no-op. The suspension counter is
//! guarded by the same mutex the loop holds while writing, so once
//! [`FanControlLoop::enter_diagnostic_mode`] returns no loop write is in
//! flight and none can start.

use crate::curve::{CurvePoint, FanCurve, MAX_DUTY_PERCENT};
use crate::error::Result;
use crate::hardware::FanHardware;
use crate::preset::{CUSTOM_PRESET_NAME, ControlMode, Preset};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

/// Consecutive failures on one channel before a repeat warning is logged.
const ERROR_LOG_EVERY: u32 = 10;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Result of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Diagnostic mode is active; nothing was written.
    Suspended,
    Applied(TickReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Channels that received a new duty
    pub written: usize,
    /// Channels already at their target duty
    pub unchanged: usize,
    /// Channels whose read or write failed
    pub failed: usize,
}

/// Per-channel view for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub index: usize,
    pub last_temperature_c: Option<f64>,
    pub last_applied_percent: Option<u8>,
    pub consecutive_errors: u32,
}

/// Read-only copy of the loop's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub mode: ControlMode,
    pub selected_preset: Option<String>,
    pub live_curve: Vec<CurvePoint>,
    pub diagnostic_depth: usize,
    pub channels: Vec<ChannelStatus>,
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChannelRuntime {
    last_applied: Option<u8>,
    last_temperature: Option<f64>,
    consecutive_errors: u32,
}

impl ChannelRuntime {
    fn record_error(&mut self, index: usize, what: &str, err: &dyn std::fmt::Display) {
        self.consecutive_errors += 1;
        if self.consecutive_errors == 1 {
            log::error!("Fan channel {index}: {what} failed: {err}");
        } else if self.consecutive_errors % ERROR_LOG_EVERY == 0 {
            log::warn!(
                "Fan channel {index}: {what} has failed {} times in a row: {err}",
                self.consecutive_errors
            );
        }
    }
}

struct LoopState {
    selected: Option<Preset>,
    mode: ControlMode,
    live_curve: FanCurve,
    diagnostic_depth: usize,
    channels: Vec<ChannelRuntime>,
}

// ---------------------------------------------------------------------------
// FanControlLoop
// ---------------------------------------------------------------------------

pub struct FanControlLoop {
    hardware: Arc<dyn FanHardware>,
    state: Mutex<LoopState>,
}

impl FanControlLoop {
    /// Start in Auto mode with the stock Auto curve. Nothing is written until
    /// the first tick or apply.
    pub fn new(hardware: Arc<dyn FanHardware>) -> Self {
        let auto = Preset::auto();
        Self {
            hardware,
            state: Mutex::new(LoopState {
                mode: auto.mode,
                live_curve: auto.curve.clone(),
                selected: Some(auto),
                diagnostic_depth: 0,
                channels: Vec::new(),
            }),
        }
    }

    /// One evaluation pass over every channel.
    pub fn tick(&self) -> TickOutcome {
        let mut state = self.lock();
        self.apply_locked(&mut state)
    }

    /// Select a preset: its curve is copied into the live curve and applied
    /// immediately.
    pub fn apply_preset(&self, preset: &Preset) -> TickOutcome {
        let mut state = self.lock();
        state.mode = preset.mode;
        state.live_curve = preset.curve.clone();
        state.selected = Some(preset.clone());
        log::info!("Applying preset '{}' ({:?})", preset.name, preset.mode);
        self.apply_locked(&mut state)
    }

    /// Apply an unsaved curve through an ephemeral Manual preset.
    pub fn apply_custom_curve(&self, points: Vec<CurvePoint>) -> Result<TickOutcome> {
        let curve = FanCurve::new(points)?;
        let preset = Preset::new(CUSTOM_PRESET_NAME, ControlMode::Manual, curve);
        Ok(self.apply_preset(&preset))
    }

    /// Edit the live working curve. The selected preset is left untouched
    /// until it is explicitly saved.
    pub fn update_live_curve(&self, points: Vec<CurvePoint>) -> Result<TickOutcome> {
        let curve = FanCurve::new(points)?;
        let mut state = self.lock();
        state.live_curve = curve;
        Ok(self.apply_locked(&mut state))
    }

    /// Suspend loop writes. Returns the new suspension depth.
    pub fn enter_diagnostic_mode(&self) -> usize {
        let mut state = self.lock();
        state.diagnostic_depth += 1;
        if state.diagnostic_depth == 1 {
            log::info!("Entering diagnostic mode; curve engine suspended");
        } else {
            log::debug!("Diagnostic mode nested (depth {})", state.diagnostic_depth);
        }
        state.diagnostic_depth
    }

    /// Release one level of suspension. When the last level is released the
    /// current curve is re-applied straight away against fresh temperatures.
    ///
    /// Returns `false` if the loop was not suspended.
    pub fn exit_diagnostic_mode(&self) -> bool {
        let mut state = self.lock();
        if state.diagnostic_depth == 0 {
            log::warn!("exit_diagnostic_mode called while not in diagnostic mode");
            return false;
        }

        state.diagnostic_depth -= 1;
        if state.diagnostic_depth == 0 {
            log::info!("Leaving diagnostic mode; curve engine resumed");
            // Diagnostic writes bypassed the cache, so force a fresh write.
            for channel in &mut state.channels {
                channel.last_applied = None;
            }
            self.apply_locked(&mut state);
        }
        true
    }

    /// Enter diagnostic mode for the lifetime of the returned guard.
    pub fn diagnostic_lease(self: &Arc<Self>) -> DiagnosticLease {
        self.enter_diagnostic_mode();
        DiagnosticLease {
            fan_loop: Arc::clone(self),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().diagnostic_depth > 0
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let state = self.lock();
        ControlSnapshot {
            mode: state.mode,
            selected_preset: state.selected.as_ref().map(|p| p.name.clone()),
            live_curve: state.live_curve.points().to_vec(),
            diagnostic_depth: state.diagnostic_depth,
            channels: state
                .channels
                .iter()
                .enumerate()
                .map(|(index, c)| ChannelStatus {
                    index,
                    last_temperature_c: c.last_temperature,
                    last_applied_percent: c.last_applied,
                    consecutive_errors: c.consecutive_errors,
                })
                .collect(),
        }
    }

    /// Tick every `period` until `shutdown` flips to `true` or its sender is
    /// dropped. Overdue ticks are skipped, never queued.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("Curve engine started, period {}ms", period.as_millis());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let TickOutcome::Applied(report) = self.tick() {
                        if report.written > 0 {
                            log::debug!("Curve engine tick: {report:?}");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Curve engine stopped");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn apply_locked(&self, state: &mut LoopState) -> TickOutcome {
        if state.diagnostic_depth > 0 {
            return TickOutcome::Suspended;
        }

        let count = self.hardware.channel_count();
        state.channels.resize_with(count, ChannelRuntime::default);

        let LoopState {
            mode,
            live_curve,
            channels,
            ..
        } = state;
        let mut report = TickReport::default();

        for (index, runtime) in channels.iter_mut().enumerate() {
            let target = match mode {
                ControlMode::Max => MAX_DUTY_PERCENT,
                ControlMode::Auto | ControlMode::Manual => {
                    match self.hardware.read_temperature(index) {
                        Ok(temp) => {
                            runtime.last_temperature = Some(temp);
                            live_curve.interpolate(temp)
                        }
                        Err(e) => {
                            runtime.record_error(index, "temperature read", &e);
                            report.failed += 1;
                            continue;
                        }
                    }
                }
            };

            if runtime.last_applied == Some(target) {
                report.unchanged += 1;
                continue;
            }

            match self.hardware.write_duty_cycle(index, target) {
                Ok(()) => {
                    log::debug!("Fan channel {index}: duty {target}%");
                    runtime.last_applied = Some(target);
                    runtime.consecutive_errors = 0;
                    report.written += 1;
                }
                Err(e) => {
                    runtime.record_error(index, "duty write", &e);
                    report.failed += 1;
                }
            }
        }

        TickOutcome::Applied(report)
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds the control loop in diagnostic mode until dropped.
///
/// Dropping the lease (normal return, `?`, panic unwind or a cancelled
/// future) releases exactly one level of suspension.
#[must_use = "diagnostic mode ends as soon as the lease is dropped"]
pub struct DiagnosticLease {
    fan_loop: Arc<FanControlLoop>,
}

impl Drop for DiagnosticLease {
    fn drop(&mut self) {
        self.fan_loop.exit_diagnostic_mode();
    }
}

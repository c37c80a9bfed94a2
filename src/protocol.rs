// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Client-daemon protocol over Unix domain sockets.
//!
//! Messages are newline-delimited JSON. The client sends a [`Request`]
//! and the daemon replies with a [`Response`].

use crate::curve::CurvePoint;
use crate::fan_loop::ControlSnapshot;
use crate::hardware::FanState;
use crate::preset::{ControlMode, Preset};
use crate::verify::{RpmSample, VerificationResult};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Requests (client -> daemon)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Request the control loop snapshot and live fan readings.
    #[serde(rename = "get_status")]
    GetStatus,

    /// List built-in and user presets.
    #[serde(rename = "list_presets")]
    ListPresets,

    /// Apply a preset by exact (case-insensitive) name.
    #[serde(rename = "apply_preset")]
    ApplyPreset { name: String },

    /// Apply a preset by name, falling back to keyword matching.
    #[serde(rename = "apply_fan_mode")]
    ApplyFanMode { name: String },

    /// Apply an unsaved curve.
    #[serde(rename = "apply_custom_curve")]
    ApplyCustomCurve { points: Vec<CurvePoint> },

    /// Replace the live working curve without touching the selected preset.
    #[serde(rename = "update_live_curve")]
    UpdateLiveCurve { points: Vec<CurvePoint> },

    /// Save the live curve as a user preset.
    #[serde(rename = "save_preset")]
    SavePreset { name: String, mode: ControlMode },

    /// Delete a user preset by name.
    #[serde(rename = "delete_preset")]
    DeletePreset { name: String },

    /// Import presets from a JSON document on the daemon's filesystem.
    #[serde(rename = "import_presets")]
    ImportPresets { path: String },

    /// Export user presets to a JSON document on the daemon's filesystem.
    #[serde(rename = "export_presets")]
    ExportPresets { path: String },

    /// Read RPM and level for one fan.
    #[serde(rename = "get_fan_state")]
    GetFanState { fan_index: usize },

    /// Sample RPM without writing anything.
    #[serde(rename = "sample_rpm")]
    SampleRpm {
        fan_index: usize,
        sample_count: usize,
    },

    /// Run a diagnostic apply-and-verify cycle.
    #[serde(rename = "verify")]
    Verify { fan_index: usize, percent: i32 },

    /// Cancel a running verification or sampling on a fan.
    #[serde(rename = "cancel_verify")]
    CancelVerify { fan_index: usize },

    /// Past verification results, most recent first.
    #[serde(rename = "verification_history")]
    VerificationHistory,
}

// ---------------------------------------------------------------------------
// Responses (daemon -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Current control state.
    #[serde(rename = "status")]
    Status {
        snapshot: ControlSnapshot,
        fans: Vec<FanStateInfo>,
        verification_available: bool,
    },

    #[serde(rename = "presets")]
    Presets { presets: Vec<Preset> },

    #[serde(rename = "fan_state")]
    FanState { fan_index: usize, state: FanState },

    #[serde(rename = "rpm")]
    Rpm { fan_index: usize, sample: RpmSample },

    #[serde(rename = "verification")]
    Verification { result: VerificationResult },

    #[serde(rename = "history")]
    History { results: Vec<VerificationResult> },

    /// Operation succeeded.
    #[serde(rename = "ok")]
    Ok { message: String },

    /// Operation failed.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Live reading for one channel in status messages; `state` is absent when
/// the read failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanStateInfo {
    pub fan_index: usize,
    pub state: Option<FanState>,
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Encode a message as a newline-delimited JSON string.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut s = serde_json::to_string(msg)?;
    s.push('\n');
    Ok(s)
}

/// Decode a message from a JSON string (newline-trimmed).
pub fn decode<'a, T: Deserialize<'a>>(s: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(s.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let line = encode(&Request::Verify {
            fan_index: 0,
            percent: 75,
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(
            line.trim(),
            r#"{"type":"verify","fan_index":0,"percent":75}"#
        );
    }

    #[test]
    fn test_decode_custom_curve_request() {
        let req: Request = decode(
            r#"{"type":"apply_custom_curve","points":[{"temp_c":40.0,"duty":30}]}"#,
        )
        .unwrap();
        assert!(matches!(req, Request::ApplyCustomCurve { points } if points.len() == 1));
    }

    #[test]
    fn test_unknown_request_type_is_rejected() {
        assert!(decode::<Request>(r#"{"type":"reboot"}"#).is_err());
    }
}

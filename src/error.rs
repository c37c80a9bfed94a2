// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error type shared by the control core.
//!
//! Variants follow the failure taxonomy of the core: validation problems are
//! rejected before any side effect, I/O and parse problems surface at the
//! preset store boundary, hardware problems at the loop or verifier boundary,
//! and cancellation is an early termination rather than a fault.

use std::io;
use std::path::PathBuf;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------
    #[error("Invalid curve: {0}")]
    InvalidCurve(String),

    #[error("Invalid preset name: {0}")]
    InvalidPresetName(String),

    #[error("Preset '{0}' is built in and cannot be modified")]
    BuiltInPreset(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Duty {0}% is outside 0-100")]
    DutyOutOfRange(i32),

    #[error("Unknown fan channel: {0}")]
    UnknownChannel(usize),

    #[error("Sample count {requested} is outside 1-{max}")]
    SampleCountOutOfRange { requested: usize, max: usize },

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------
    #[error("Failed to read {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to write {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    #[error("Failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("Failed to serialize {what}: {reason}")]
    Serialize { what: String, reason: String },

    // ------------------------------------------------------------------
    // Hardware
    // ------------------------------------------------------------------
    #[error("Hardware error on channel {channel}: {reason}")]
    Hardware { channel: usize, reason: String },

    #[error("No verification-capable fan channel is available")]
    VerificationUnavailable,

    #[error("A verification is already running on channel {0}")]
    VerificationBusy(usize),

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn hardware(channel: usize, reason: impl ToString) -> Self {
        Error::Hardware {
            channel,
            reason: reason.to_string(),
        }
    }

    /// True for errors raised before any side effect took place.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidCurve(_)
                | Error::InvalidPresetName(_)
                | Error::BuiltInPreset(_)
                | Error::UnknownPreset(_)
                | Error::DutyOutOfRange(_)
                | Error::UnknownChannel(_)
                | Error::SampleCountOutOfRange { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

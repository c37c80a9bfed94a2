// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Laptop fan control core.
//!
//! - [`curve`]: temperature-to-duty curves and interpolation
//! - [`preset`]: built-in and user presets, persistence, import/export
//! - [`fan_loop`]: the continuous curve engine and diagnostic suspension
//! - [`verify`]: diagnostic apply-and-verify with RPM stability sampling
//! - [`hwmon`]: Linux hwmon backend for [`hardware::FanHardware`]
//!
//! The daemon binary wires these together once at startup; nothing here is
//! global.

pub mod cancel;
pub mod config;
pub mod curve;
pub mod error;
pub mod fan_loop;
pub mod hardware;
pub mod hwmon;
pub mod mode_select;
pub mod preset;
pub mod protocol;
pub mod verify;

pub use error::{Error, Result};

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Mode selection by name.
//!
//! A requested name is first matched against preset names
//! (case-insensitive). Only when nothing matches does the keyword layer
//! guess a built-in preset from words such as "boost" or "silent"; that guess
//! is best effort and falls back to Auto.

use crate::fan_loop::{FanControlLoop, TickOutcome};
use crate::preset::{AUTO_PRESET_NAME, MANUAL_PRESET_NAME, MAX_PRESET_NAME, Preset, PresetStore};

/// Keyword families recognised when no preset name matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanModeKeyword {
    /// "performance", "boost", "max"
    Performance,
    /// "quiet", "silent"
    Quiet,
    /// Anything else
    Balanced,
}

impl FanModeKeyword {
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let has_any = |words: &[&str]| words.iter().any(|w| name.contains(w));

        if has_any(&["performance", "boost", "max"]) {
            FanModeKeyword::Performance
        } else if has_any(&["quiet", "silent"]) {
            FanModeKeyword::Quiet
        } else {
            FanModeKeyword::Balanced
        }
    }

    /// Built-in preset chosen for this keyword.
    pub fn preset_name(self) -> &'static str {
        match self {
            FanModeKeyword::Performance => MAX_PRESET_NAME,
            FanModeKeyword::Quiet => MANUAL_PRESET_NAME,
            FanModeKeyword::Balanced => AUTO_PRESET_NAME,
        }
    }
}

/// How a requested name was turned into a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ExactMatch,
    Keyword(FanModeKeyword),
}

#[derive(Debug, Clone)]
pub struct ResolvedMode {
    pub preset: Preset,
    pub resolution: Resolution,
}

/// Find the preset for `name`, falling back to the keyword layer.
pub fn resolve_fan_mode(store: &PresetStore, name: &str) -> ResolvedMode {
    if let Some(preset) = store.get(name) {
        return ResolvedMode {
            preset,
            resolution: Resolution::ExactMatch,
        };
    }

    let keyword = FanModeKeyword::from_name(name);
    let preset = store
        .get(keyword.preset_name())
        .unwrap_or_else(Preset::auto);
    log::info!(
        "No preset named '{name}', using '{}' ({keyword:?} keyword)",
        preset.name
    );
    ResolvedMode {
        preset,
        resolution: Resolution::Keyword(keyword),
    }
}

/// Resolve `name` and apply the result to the control loop.
pub fn apply_fan_mode(
    store: &PresetStore,
    fan_loop: &FanControlLoop,
    name: &str,
) -> (ResolvedMode, TickOutcome) {
    let resolved = resolve_fan_mode(store, name);
    let outcome = fan_loop.apply_preset(&resolved.preset);
    (resolved, outcome)
}

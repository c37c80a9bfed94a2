// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Presets and the preset store.
//!
//! A preset is a named curve plus a control mode. Three built-in presets
//! (Max, Auto, Manual) always exist, are never persisted, and cannot be
//! replaced by save or import. User presets live after them in insertion
//! order and are written back to a [`PresetRepository`] wholesale after
//! every change.

use crate::curve::{self, FanCurve};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// Format version written into export documents.
pub const EXPORT_FORMAT_VERSION: &str = "1.1";

pub const MAX_PRESET_NAME: &str = "Max";
pub const AUTO_PRESET_NAME: &str = "Auto";
pub const MANUAL_PRESET_NAME: &str = "Manual";

/// Name given to the ephemeral preset built by
/// [`FanControlLoop::apply_custom_curve`](crate::fan_loop::FanControlLoop::apply_custom_curve).
/// Reserved so it can never collide with a saved preset.
pub const CUSTOM_PRESET_NAME: &str = "(custom curve)";

/// Names skipped when importing a document.
const IMPORT_SKIPPED_NAMES: [&str; 3] = [MAX_PRESET_NAME, AUTO_PRESET_NAME, MANUAL_PRESET_NAME];

// ---------------------------------------------------------------------------
// Preset types
// ---------------------------------------------------------------------------

/// How the control loop turns a temperature into a duty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Full duty regardless of temperature.
    Max,
    /// Curve interpolation with the stock curve.
    Auto,
    /// Curve interpolation with a user-authored curve.
    Manual,
}

/// A named, mode-tagged fan curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub name: String,
    pub mode: ControlMode,
    #[serde(default)]
    pub is_built_in: bool,
    pub curve: FanCurve,
}

impl Preset {
    /// A user (non-built-in) preset.
    pub fn new(name: impl Into<String>, mode: ControlMode, curve: FanCurve) -> Self {
        Self {
            name: name.into(),
            mode,
            curve,
            is_built_in: false,
        }
    }

    pub fn max() -> Self {
        Self::built_in(MAX_PRESET_NAME, ControlMode::Max, curve::max_curve())
    }

    pub fn auto() -> Self {
        Self::built_in(AUTO_PRESET_NAME, ControlMode::Auto, curve::default_auto_curve())
    }

    pub fn manual() -> Self {
        Self::built_in(
            MANUAL_PRESET_NAME,
            ControlMode::Manual,
            curve::default_manual_curve(),
        )
    }

    /// The built-in presets in listing order.
    pub fn built_ins() -> Vec<Preset> {
        vec![Self::max(), Self::auto(), Self::manual()]
    }

    fn built_in(name: &str, mode: ControlMode, curve: FanCurve) -> Self {
        Self {
            name: name.to_string(),
            mode,
            curve,
            is_built_in: true,
        }
    }
}

/// True for names a user preset may not take (case-insensitive).
pub fn is_reserved_name(name: &str) -> bool {
    let name = name.trim();
    IMPORT_SKIPPED_NAMES
        .iter()
        .chain(std::iter::once(&CUSTOM_PRESET_NAME))
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

fn validate_user_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidPresetName("name must not be empty".to_string()));
    }
    if is_reserved_name(name) {
        return Err(Error::BuiltInPreset(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Import / export document
// ---------------------------------------------------------------------------

/// The exchange format for user presets.
///
/// Unknown fields are ignored so newer documents still import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetDocument {
    #[serde(default = "Utc::now")]
    pub export_date: DateTime<Utc>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub presets: Vec<Preset>,
}

impl PresetDocument {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialize {
            what: "preset document".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Parse {
            what: "preset document".to_string(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Persistence seam
// ---------------------------------------------------------------------------

/// Where user presets are persisted (the configuration file in the daemon).
pub trait PresetRepository: Send + Sync {
    /// Read the stored user presets.
    fn load_presets(&self) -> Result<Vec<Preset>>;

    /// Replace the stored preset list with `presets`.
    fn store_presets(&self, presets: &[Preset]) -> Result<()>;
}

/// Change notifications published by [`PresetStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresetEvent {
    Loaded { count: usize },
    Saved { name: String },
    Deleted { name: String },
    Imported { count: usize },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct PresetStore {
    repository: Arc<dyn PresetRepository>,
    user_presets: RwLock<Vec<Preset>>,
    events: broadcast::Sender<PresetEvent>,
}

impl PresetStore {
    /// Create a store holding only the built-ins.
    pub fn new(repository: Arc<dyn PresetRepository>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            repository,
            user_presets: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Receive a [`PresetEvent`] after every successful change.
    pub fn subscribe(&self) -> broadcast::Receiver<PresetEvent> {
        self.events.subscribe()
    }

    /// Built-ins (Max, Auto, Manual) followed by user presets in insertion order.
    pub fn list_presets(&self) -> Vec<Preset> {
        let mut presets = Preset::built_ins();
        presets.extend(self.read().iter().cloned());
        presets
    }

    /// User presets only, in insertion order.
    pub fn user_presets(&self) -> Vec<Preset> {
        self.read().clone()
    }

    /// Case-insensitive lookup across built-in and user presets.
    pub fn get(&self, name: &str) -> Option<Preset> {
        let name = name.trim();
        self.list_presets()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Save a user preset, replacing any user preset whose name matches
    /// ignoring case.
    pub fn save(&self, preset: Preset) -> Result<()> {
        validate_user_name(&preset.name)?;
        preset.curve.validate()?;

        let name = preset.name.clone();
        self.commit(|presets| {
            replace_by_name(presets, preset);
            Ok(())
        })?;

        log::info!("Saved preset '{name}'");
        self.notify(PresetEvent::Saved { name });
        Ok(())
    }

    /// Delete a user preset, matched ignoring case. Returns `false` if no
    /// such preset exists.
    pub fn delete(&self, name: &str) -> Result<bool> {
        if is_reserved_name(name) {
            return Err(Error::BuiltInPreset(name.to_string()));
        }
        let name = name.trim();
        if !self.read().iter().any(|p| p.name.eq_ignore_ascii_case(name)) {
            return Ok(false);
        }

        self.commit(|presets| {
            presets.retain(|p| !p.name.eq_ignore_ascii_case(name));
            Ok(())
        })?;

        log::info!("Deleted preset '{name}'");
        self.notify(PresetEvent::Deleted {
            name: name.to_string(),
        });
        Ok(true)
    }

    /// Merge the repository's presets into the store at startup.
    ///
    /// Built-in names and names already present (ignoring case) are skipped
    /// (first wins).
    /// Nothing is written back.
    pub fn load_from_persistent_store(&self) -> Result<usize> {
        let stored = self.repository.load_presets()?;
        let mut presets = self.write();
        let mut loaded = 0;

        for mut preset in stored {
            if is_reserved_name(&preset.name) || preset.name.trim().is_empty() {
                log::warn!("Skipping stored preset with reserved name '{}'", preset.name);
                continue;
            }
            if presets.iter().any(|p| p.name.eq_ignore_ascii_case(&preset.name)) {
                log::warn!("Skipping duplicate stored preset '{}'", preset.name);
                continue;
            }
            preset.is_built_in = false;
            presets.push(preset);
            loaded += 1;
        }
        drop(presets);

        log::info!("Loaded {loaded} preset(s) from configuration");
        self.notify(PresetEvent::Loaded { count: loaded });
        Ok(loaded)
    }

    /// Write the current user presets to the repository.
    ///
    /// Every mutation already persists before it takes effect. This rewrites
    /// the repository from the in-memory list as it stands.
    pub fn persist(&self) -> Result<()> {
        let presets = self.read();
        self.repository.store_presets(&presets)
    }

    /// Import a document, replacing same-named user presets. Returns the
    /// number of presets accepted.
    pub fn import_document(&self, doc: PresetDocument) -> Result<usize> {
        if doc.version != EXPORT_FORMAT_VERSION {
            log::warn!(
                "Importing preset document version '{}' (expected {EXPORT_FORMAT_VERSION})",
                doc.version
            );
        }

        let mut count = 0;
        self.commit(|presets| {
            for mut preset in doc.presets {
                if is_reserved_name(&preset.name) {
                    log::debug!("Import skipped reserved preset '{}'", preset.name);
                    continue;
                }
                if preset.name.trim().is_empty() {
                    log::warn!("Import skipped preset with empty name");
                    continue;
                }
                preset.is_built_in = false;
                replace_by_name(presets, preset);
                count += 1;
            }
            Ok(())
        })?;

        log::info!("Imported {count} preset(s)");
        self.notify(PresetEvent::Imported { count });
        Ok(count)
    }

    /// Snapshot the user presets into an exchange document.
    pub fn export_document(&self) -> PresetDocument {
        PresetDocument {
            export_date: Utc::now(),
            version: EXPORT_FORMAT_VERSION.to_string(),
            presets: self.user_presets(),
        }
    }

    /// Read a JSON document from `path` and import it.
    pub fn import_file(&self, path: &Path) -> Result<usize> {
        let contents = fs::read_to_string(path).map_err(|source| Error::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let doc = PresetDocument::from_json(&contents)?;
        self.import_document(doc)
    }

    /// Export the user presets to `path` as pretty-printed JSON.
    pub fn export_file(&self, path: &Path) -> Result<usize> {
        let doc = self.export_document();
        let json = doc.to_json()?;
        fs::write(path, json).map_err(|source| Error::FileWrite {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Exported {} preset(s) to {}", doc.presets.len(), path.display());
        Ok(doc.presets.len())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Apply `change` to a copy, persist the copy, then swap it in. On any
    /// error the in-memory list is left as it was.
    fn commit<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Preset>) -> Result<()>,
    {
        let mut presets = self.write();
        let mut next = presets.clone();
        change(&mut next)?;

        if let Err(e) = self.repository.store_presets(&next) {
            log::error!("Failed to persist presets: {e}");
            return Err(e);
        }
        *presets = next;
        Ok(())
    }

    fn notify(&self, event: PresetEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Preset>> {
        self.user_presets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Preset>> {
        self.user_presets.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Names are unique ignoring ASCII case, matching [`PresetStore::get`].
fn replace_by_name(presets: &mut Vec<Preset>, preset: Preset) {
    presets.retain(|p| !p.name.eq_ignore_ascii_case(&preset.name));
    presets.push(preset);
}

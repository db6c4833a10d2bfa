// Reconciliation settings for the engine.
//
// Global config: `~/.folio/config.toml`. Missing or unparsable files fall
// back to defaults; the settings surface is consulted by the coordinator
// to decide whether conflicts are auto-resolved or surfaced to the UI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use folio_common::types::ResolutionStrategy;

/// Root directory for Folio global state: `~/.folio/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".folio"))
}

/// Path to the global config file: `~/.folio/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// How pending external changes are announced to the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStyle {
    /// Modal banner over the document view.
    Banner,
    /// Unobtrusive badge on the document tab.
    Badge,
    /// No visible notification; changes accumulate in the pending list.
    Silent,
}

/// User-facing reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Apply the default strategy automatically when no conflict is
    /// critical, instead of surfacing a conflict UI.
    pub auto_reload: bool,
    pub show_notifications: bool,
    pub notification_style: NotificationStyle,
    /// Coalescing window for the watch queue, in milliseconds.
    pub batch_delay_ms: u64,
    /// Strategy used by auto-reload and offered as the default choice.
    pub default_strategy: ResolutionStrategy,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            auto_reload: false,
            show_notifications: true,
            notification_style: NotificationStyle::Banner,
            batch_delay_ms: 100,
            default_strategy: ResolutionStrategy::MergePreferLocal,
        }
    }
}

impl ReconcileSettings {
    /// Load from `~/.folio/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to `~/.folio/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = global_config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

//! TOML-based engine configuration.
//!
//! Stores the externally supplied knobs the engine core does not own:
//! - Quota cap and rolling-window size
//! - Quick-task durations (default plus per-app overrides)
//! - The overlay host package and the transient-surface allowlist
//! - Watchdog and debounce timings
//!
//! Configuration is stored at `~/.config/pausegate/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::data_dir;
use crate::error::ConfigError;
use crate::events::AppId;

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Quick-task grants per window.
    #[serde(default = "default_quota_max")]
    pub max: u32,
    /// Rolling window size in minutes.
    #[serde(default = "default_quota_window_minutes")]
    pub window_minutes: u64,
}

/// Quick-task duration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickTaskConfig {
    /// Default grant duration in minutes.
    #[serde(default = "default_quick_task_minutes")]
    pub default_minutes: u64,
    /// Per-app overrides, keyed by app id.
    #[serde(default)]
    pub overrides: HashMap<AppId, u64>,
}

/// Surface/foreground-tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    /// Package id of the overlay host itself. When this is the raw
    /// foreground, the session's underlying app is the effective foreground.
    #[serde(default = "default_overlay_package")]
    pub overlay_package: String,
    /// App-id prefixes that never count as a foreground mismatch (input
    /// methods, launchers, permission prompts).
    #[serde(default = "default_transient_surfaces")]
    pub transient_surfaces: Vec<String>,
}

/// Watchdog and debounce timings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum spacing between resume-command emissions per app.
    #[serde(default = "default_resume_debounce_ms")]
    pub resume_debounce_ms: u64,
    /// Quit-suppression window after a post-choice quit.
    #[serde(default = "default_quit_suppression_ms")]
    pub quit_suppression_ms: u64,
    /// Force-finish a surface that never mounts within this window.
    #[serde(default = "default_boot_watchdog_ms")]
    pub boot_watchdog_ms: u64,
    /// Force-clean state if teardown confirmation never arrives.
    #[serde(default = "default_finish_verify_ms")]
    pub finish_verify_ms: u64,
    /// How long the foreground may disagree with the session before the
    /// session is considered stale.
    #[serde(default = "default_mismatch_threshold_ms")]
    pub mismatch_threshold_ms: u64,
    /// Delay before replaying entry evaluation after a mismatch recovery.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Delay before the single retry of a decision made while the
    /// presentation layer was not ready.
    #[serde(default = "default_deferred_retry_ms")]
    pub deferred_retry_ms: u64,
}

/// Engine configuration root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub quick_task: QuickTaskConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_quota_max() -> u32 {
    6
}
fn default_quota_window_minutes() -> u64 {
    24 * 60
}
fn default_quick_task_minutes() -> u64 {
    5
}
fn default_overlay_package() -> String {
    "app.pausegate.overlay".into()
}
fn default_transient_surfaces() -> Vec<String> {
    vec![
        "com.android.inputmethod".into(),
        "com.google.android.inputmethod".into(),
        "com.android.systemui".into(),
        "com.android.permissioncontroller".into(),
        "com.android.launcher".into(),
    ]
}
fn default_resume_debounce_ms() -> u64 {
    800
}
fn default_quit_suppression_ms() -> u64 {
    1500
}
fn default_boot_watchdog_ms() -> u64 {
    2000
}
fn default_finish_verify_ms() -> u64 {
    3000
}
fn default_mismatch_threshold_ms() -> u64 {
    800
}
fn default_settle_delay_ms() -> u64 {
    400
}
fn default_deferred_retry_ms() -> u64 {
    500
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max: default_quota_max(),
            window_minutes: default_quota_window_minutes(),
        }
    }
}

impl Default for QuickTaskConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_quick_task_minutes(),
            overrides: HashMap::new(),
        }
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            overlay_package: default_overlay_package(),
            transient_surfaces: default_transient_surfaces(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            resume_debounce_ms: default_resume_debounce_ms(),
            quit_suppression_ms: default_quit_suppression_ms(),
            boot_watchdog_ms: default_boot_watchdog_ms(),
            finish_verify_ms: default_finish_verify_ms(),
            mismatch_threshold_ms: default_mismatch_threshold_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            deferred_retry_ms: default_deferred_retry_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            quick_task: QuickTaskConfig::default(),
            surface: SurfaceConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl EngineConfig {
    fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from disk or write and return the default.
    ///
    /// # Errors
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
            }
            Err(_) => {
                let cfg = Self::default();
                cfg.save()?;
                Ok(cfg)
            }
        }
    }

    /// Load from disk, returning the default on any error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Persist to disk.
    ///
    /// # Errors
    /// Returns an error if the config cannot be serialized or written.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| ConfigError::SaveFailed {
            path,
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }
        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current
                    .as_object_mut()
                    .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
                let existing = obj
                    .get(part)
                    .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|_| ConfigError::InvalidValue {
                            key: key.to_string(),
                            message: format!("cannot parse '{value}' as bool"),
                        })?,
                    ),
                    serde_json::Value::Number(_) => {
                        let n = value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                            key: key.to_string(),
                            message: format!("cannot parse '{value}' as number"),
                        })?;
                        serde_json::Value::Number(n.into())
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| ConfigError::InvalidValue {
                            key: key.to_string(),
                            message: e.to_string(),
                        })?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current
                .get_mut(part)
                .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        }

        Err(ConfigError::UnknownKey(key.to_string()))
    }

    /// Get a config value as a string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key and persist.
    ///
    /// # Errors
    /// Returns an error if the key is unknown, the value cannot be parsed,
    /// or the config cannot be saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        *self =
            serde_json::from_value(json).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        self.save()?;
        Ok(())
    }

    /// Quick-task duration for an app, honoring per-app overrides.
    pub fn quick_task_minutes(&self, app_id: &str) -> u64 {
        self.quick_task
            .overrides
            .get(app_id)
            .copied()
            .unwrap_or(self.quick_task.default_minutes)
    }

    /// Whether an app id matches the transient-surface allowlist.
    pub fn is_transient_surface(&self, app_id: &str) -> bool {
        self.surface
            .transient_surfaces
            .iter()
            .any(|prefix| app_id.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.quota.max, 6);
        assert_eq!(parsed.timing.boot_watchdog_ms, 2000);
        assert_eq!(parsed.quick_task.default_minutes, 5);
    }

    #[test]
    fn empty_toml_fills_defaults() {
        let parsed: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.quota.window_minutes, 24 * 60);
        assert_eq!(parsed.timing.resume_debounce_ms, 800);
        assert!(!parsed.surface.transient_surfaces.is_empty());
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.get("quota.max").as_deref(), Some("6"));
        assert_eq!(cfg.get("timing.quit_suppression_ms").as_deref(), Some("1500"));
        assert!(cfg.get("quota.missing_key").is_none());
    }

    #[test]
    fn set_json_value_by_path_rejects_unknown_key() {
        let mut json = serde_json::to_value(EngineConfig::default()).unwrap();
        let result = EngineConfig::set_json_value_by_path(&mut json, "quota.nonexistent", "3");
        assert!(result.is_err());
    }

    #[test]
    fn set_json_value_by_path_updates_number() {
        let mut json = serde_json::to_value(EngineConfig::default()).unwrap();
        EngineConfig::set_json_value_by_path(&mut json, "quota.max", "9").unwrap();
        assert_eq!(
            EngineConfig::get_json_value_by_path(&json, "quota.max").unwrap(),
            &serde_json::Value::Number(9.into())
        );
    }

    #[test]
    fn per_app_override_wins() {
        let mut cfg = EngineConfig::default();
        cfg.quick_task
            .overrides
            .insert("com.example.feed".to_string(), 2);
        assert_eq!(cfg.quick_task_minutes("com.example.feed"), 2);
        assert_eq!(cfg.quick_task_minutes("com.example.other"), 5);
    }

    #[test]
    fn transient_surface_prefix_match() {
        let cfg = EngineConfig::default();
        assert!(cfg.is_transient_surface("com.android.systemui"));
        assert!(cfg.is_transient_surface("com.android.launcher3"));
        assert!(!cfg.is_transient_surface("com.example.feed"));
    }
}

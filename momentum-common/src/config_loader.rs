//! Modular configuration loader.
//!
//! Supports loading configuration from multiple files:
//! - `config.json` - Core configuration
//! - `secrets.json` - Values kept out of the main file (Redis URL, API base URL)
//!
//! Files are loaded from `~/.momentum/` and deep-merged.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::config_dir;

/// Configuration file names, lowest priority first
pub const CONFIG_FILES: &[&str] = &["config.json", "secrets.json"];

/// Parse one config file. A missing file is `None`.
fn read_layer(path: &Path) -> Result<Option<Map<String, Value>>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    serde_json::from_str(&content)
        .map(Some)
        .with_context(|| format!("{} must hold a JSON object", path.display()))
}

/// Overlay `layer` onto `base`: nested objects merge, anything else replaces.
fn overlay(base: &mut Map<String, Value>, layer: Map<String, Value>) {
    for (key, value) in layer {
        let value = match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                overlay(existing, nested);
                continue;
            }
            (_, value) => value,
        };
        base.insert(key, value);
    }
}

/// Load and overlay every file in [`CONFIG_FILES`] from the config directory.
///
/// Environment variables are applied separately by `Config::apply_env_overrides`.
pub fn load_modular_config(dir: Option<PathBuf>) -> Result<Value> {
    let cfg_dir = dir.unwrap_or_else(config_dir);
    tracing::debug!("Loading modular config from {}", cfg_dir.display());

    let mut merged = Map::new();
    for file in CONFIG_FILES {
        if let Some(layer) = read_layer(&cfg_dir.join(file))? {
            overlay(&mut merged, layer);
            tracing::debug!(file, "Loaded config file");
        }
    }

    Ok(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overlay_merges_nested_objects() {
        let mut base = json!({ "a": 1, "b": { "x": 10, "y": 20 } })
            .as_object()
            .cloned()
            .unwrap();
        let layer = json!({ "b": { "y": 25, "z": 30 }, "a": { "replaced": true } })
            .as_object()
            .cloned()
            .unwrap();

        overlay(&mut base, layer);

        assert_eq!(base["a"], json!({ "replaced": true }));
        assert_eq!(base["b"], json!({ "x": 10, "y": 25, "z": 30 }));
    }

    #[test]
    fn test_non_object_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "[1, 2]").unwrap();
        assert!(load_modular_config(Some(dir.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_secrets_override_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{ "cache": { "l1_capacity": 100, "redis_url": "redis://old" } }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("secrets.json"),
            r#"{ "cache": { "redis_url": "redis://new" } }"#,
        )
        .unwrap();

        let merged = load_modular_config(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(merged["cache"]["l1_capacity"], 100);
        assert_eq!(merged["cache"]["redis_url"], "redis://new");
    }

    #[test]
    fn test_missing_files_yield_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let merged = load_modular_config(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(merged, json!({}));
    }
}

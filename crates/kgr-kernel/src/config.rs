//! Configuration loading from `~/.kgr/config.toml` with defaults.
//!
//! The `include` field names additional TOML files (relative to the config
//! directory) that are deep-merged underneath the root file.

use kgr_types::config::KgrConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load configuration from a TOML file, falling back to defaults on any error.
pub fn load_config(path: Option<&Path>) -> KgrConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return KgrConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            KgrConfig::default()
        }
    }
}

fn read_config(config_path: &Path) -> Result<KgrConfig, String> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("failed to read config file: {e}"))?;
    let mut root: toml::Value =
        toml::from_str(&contents).map_err(|e| format!("failed to parse config: {e}"))?;

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut visited = HashSet::new();
    visited.insert(
        std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf()),
    );
    resolve_includes(&mut root, config_dir, &mut visited, 0)?;

    root.try_into::<KgrConfig>()
        .map_err(|e| format!("failed to deserialize config: {e}"))
}

/// Replace `value` with its includes merged underneath it.
fn resolve_includes(
    value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes: Vec<String> = match value {
        toml::Value::Table(table) => match table.remove("include") {
            Some(toml::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(_) => return Err("config include must be an array of paths".to_string()),
            None => return Ok(()),
        },
        _ => return Ok(()),
    };

    let canonical_dir = std::fs::canonicalize(config_dir)
        .map_err(|e| format!("config dir cannot be canonicalized: {e}"))?;
    let mut merged = toml::Value::Table(toml::map::Map::new());

    for include in &includes {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return Err(format!("config include rejects absolute path: {include}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("config include rejects path traversal: {include}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("config include '{include}' cannot be resolved: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("config include '{include}' escapes config directory"));
        }
        if !visited.insert(canonical.clone()) {
            return Err(format!("circular config include detected: {include}"));
        }

        info!(include = %include, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("failed to read config include '{include}': {e}"))?;
        let mut included: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("failed to parse config include '{include}': {e}"))?;
        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_includes(&mut included, &include_dir, visited, depth + 1)?;

        deep_merge_toml(&mut merged, &included);
    }

    deep_merge_toml(&mut merged, value);
    *value = merged;
    Ok(())
}

/// Deep-merge two TOML values. Tables merge recursively; otherwise `overlay` wins.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// The KGR home directory.
pub fn kgr_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".kgr")
}

/// Default config file path.
pub fn default_config_path() -> PathBuf {
    kgr_home().join("config.toml")
}

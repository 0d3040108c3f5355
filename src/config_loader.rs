//! Config file loader with cascading support
//! Supports JSON, YAML, YML formats
//! Priority: explicit path > project-dir > home-dir > exe-dir

use crate::config::NetworkConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONFIG_FILENAME: &str = ".agent-mesh.config";
const CONFIG_EXTENSIONS: &[&str] = &[".json", ".yml", ".yaml"];

/// Root configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Identity of this agent
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub specializations: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    /// Partial `NetworkConfig` tree; merged key by key
    #[serde(default)]
    pub network: Option<Value>,
}

impl ConfigFile {
    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: ConfigFile) {
        if other.agent_id.is_some() {
            self.agent_id = other.agent_id;
        }
        if other.capabilities.is_some() {
            self.capabilities = other.capabilities;
        }
        if other.specializations.is_some() {
            self.specializations = other.specializations;
        }
        if other.description.is_some() {
            self.description = other.description;
        }
        if let Some(incoming) = other.network {
            match self.network.as_mut() {
                Some(existing) => merge_values(existing, incoming),
                None => self.network = Some(incoming),
            }
        }
    }

    /// Resolve the network section on top of the defaults
    pub fn network_config(&self) -> Result<NetworkConfig> {
        let config: NetworkConfig = match &self.network {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| anyhow!("Invalid network config: {}", e))?,
            None => NetworkConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Recursively merge `incoming` into `base`; objects merge, everything else replaces
fn merge_values(base: &mut Value, incoming: Value) {
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Find config file in a directory (checks all supported extensions)
fn find_config_in_dir(dir: &Path) -> Option<PathBuf> {
    for ext in CONFIG_EXTENSIONS {
        let filepath = dir.join(format!("{}{}", CONFIG_FILENAME, ext));
        if filepath.exists() {
            return Some(filepath);
        }
    }
    None
}

/// Parse config file based on extension
pub fn parse_config_file(filepath: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(filepath)?;
    let ext = filepath
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match ext {
        "json" => serde_json::from_str(&content).map_err(|e| anyhow!("JSON parse error: {}", e)),
        "yml" | "yaml" => {
            // Go through a JSON value so the network tree merges the same way for both formats
            let value: serde_yaml::Value =
                serde_yaml::from_str(&content).map_err(|e| anyhow!("YAML parse error: {}", e))?;
            let json = serde_json::to_value(value).map_err(|e| anyhow!("YAML parse error: {}", e))?;
            serde_json::from_value(json).map_err(|e| anyhow!("YAML parse error: {}", e))
        }
        _ => Err(anyhow!("Unsupported config file extension: {}", ext)),
    }
}

/// Load config from a directory if it exists
fn load_config_from_dir(dir: &Path) -> ConfigFile {
    if let Some(filepath) = find_config_in_dir(dir) {
        match parse_config_file(&filepath) {
            Ok(config) => {
                debug!("Loaded config from: {:?}", filepath);
                return config;
            }
            Err(e) => {
                warn!("Failed to parse config file {:?}: {}", filepath, e);
            }
        }
    }
    ConfigFile::default()
}

/// Load configs from cascading locations and merge them.
/// An explicit path must parse; the cascading locations are best-effort.
pub fn load_cascading_config(explicit: Option<&Path>) -> Result<ConfigFile> {
    let mut merged = ConfigFile::default();

    for dir in config_dirs() {
        merged.merge(load_config_from_dir(&dir));
    }

    if let Some(path) = explicit {
        let config = parse_config_file(path)
            .map_err(|e| anyhow!("Failed to load {}: {}", path.display(), e))?;
        merged.merge(config);
    }

    Ok(merged)
}

/// Directories searched, lowest priority first
fn config_dirs() -> Vec<PathBuf> {
    let mut dirs_found = Vec::new();

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            dirs_found.push(exe_dir.to_path_buf());
        }
    }
    if let Some(home_dir) = dirs::home_dir() {
        dirs_found.push(home_dir);
    }
    if let Ok(cwd) = std::env::current_dir() {
        dirs_found.push(cwd);
    }

    dirs_found
}

/// Get all possible config file paths (for debugging/user info)
pub fn get_config_paths() -> Vec<PathBuf> {
    config_dirs()
        .into_iter()
        .flat_map(|dir| {
            CONFIG_EXTENSIONS
                .iter()
                .map(move |ext| dir.join(format!("{}{}", CONFIG_FILENAME, ext)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_parse_json_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(".agent-mesh.config.json");
        let mut file = fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"{{
            "agentId": "analyst",
            "capabilities": ["Python", "pandas"],
            "network": {{
                "transport": {{ "channel": "team-a" }}
            }}
        }}"#
        )
        .unwrap();

        let config = load_config_from_dir(dir.path());
        assert_eq!(config.agent_id, Some("analyst".to_string()));
        let network = config.network_config().unwrap();
        assert_eq!(network.transport.channel, "team-a");
        assert_eq!(network.transport.max_connect_attempts, 5);
    }

    #[test]
    fn test_parse_yaml_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(".agent-mesh.config.yaml");
        let mut file = fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
agentId: reviewer
network:
  registry:
    agentTimeoutMinutes: 9
"#
        )
        .unwrap();

        let config = load_config_from_dir(dir.path());
        assert_eq!(config.agent_id, Some("reviewer".to_string()));
        let network = config.network_config().unwrap();
        assert_eq!(network.registry.agent_timeout_minutes, 9);
    }

    #[test]
    fn test_merge_configs() {
        let mut base = ConfigFile {
            agent_id: Some("base".to_string()),
            description: Some("base agent".to_string()),
            network: Some(json!({
                "transport": {"channel": "base", "maxConnectAttempts": 3},
                "client": {"presenceIntervalSecs": 10}
            })),
            ..Default::default()
        };

        let override_config = ConfigFile {
            agent_id: Some("override".to_string()),
            network: Some(json!({"transport": {"channel": "override"}})),
            ..Default::default()
        };

        base.merge(override_config);

        assert_eq!(base.agent_id, Some("override".to_string()));
        assert_eq!(base.description, Some("base agent".to_string())); // Not overridden
        let network = base.network_config().unwrap();
        assert_eq!(network.transport.channel, "override");
        assert_eq!(network.transport.max_connect_attempts, 3); // Not overridden
        assert_eq!(network.client.presence_interval_secs, 10);
    }

    #[test]
    fn test_invalid_network_section_rejected() {
        let config = ConfigFile {
            network: Some(json!({"registry": {"initialTrust": 4.0}})),
            ..Default::default()
        };
        assert!(config.network_config().is_err());
    }

    #[test]
    fn test_explicit_path_must_parse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(load_cascading_config(Some(&path)).is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_DOCKER_BIN: &str = "docker";
const DEFAULT_FILE_ROOT: &str = "/";

#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub agent_id: String,
    pub token: String,
    pub ws_url: String,
    pub docker_bin: String,
    pub container_label_key: String,
    pub container_map: HashMap<String, String>,
    pub volume_map: HashMap<String, String>,
    pub file_root: String,
    pub rcon: RconConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("agent_id", &self.agent_id)
            .field("token", &"[REDACTED]")
            .field("ws_url", &self.ws_url)
            .field("docker_bin", &self.docker_bin)
            .field("container_label_key", &self.container_label_key)
            .field("container_map", &self.container_map)
            .field("volume_map", &self.volume_map)
            .field("file_root", &self.file_root)
            .field("rcon", &self.rcon)
            .field("security", &self.security)
            .field("logging", &self.logging)
            .finish()
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RconConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl std::fmt::Debug for RconConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Allow-lists. An empty list permits everything.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub allow_actions: Vec<String>,
    pub command_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config: {}", e))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, String> {
        let mut config: AgentConfig =
            serde_yaml::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.docker_bin.trim().is_empty() {
            self.docker_bin = DEFAULT_DOCKER_BIN.to_string();
        }
        if self.file_root.trim().is_empty() {
            self.file_root = DEFAULT_FILE_ROOT.to_string();
        }
    }

    fn validate(&self) -> Result<(), String> {
        for (key, value) in [
            ("agentId", &self.agent_id),
            ("token", &self.token),
            ("wsUrl", &self.ws_url),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} is required", key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "agentId: a1\ntoken: k\nwsUrl: ws://127.0.0.1:9000/agent\n";

    #[test]
    fn minimal_config_gets_defaults() {
        let config = AgentConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.agent_id, "a1");
        assert_eq!(config.docker_bin, "docker");
        assert_eq!(config.file_root, "/");
        assert!(config.container_map.is_empty());
        assert!(config.security.allow_actions.is_empty());
        assert!(!config.rcon.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn full_config_parses_and_ignores_unknown_keys() {
        let yaml = r#"
agentId: node-7
token: secret
wsUrl: wss://panel.example/agent
dockerBin: podman
containerLabelKey: minebot.server
containerMap:
  survival: mc-survival
volumeMap:
  survival: survival-data
fileRoot: /srv/games
rcon:
  enabled: true
  host: 127.0.0.1
  port: 25575
  password: hunter2
security:
  allowActions: [STATS, LIST]
  commandAllowlist: ["say ", "list"]
somethingElse: 42
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.docker_bin, "podman");
        assert_eq!(config.container_label_key, "minebot.server");
        assert_eq!(config.container_map["survival"], "mc-survival");
        assert_eq!(config.volume_map["survival"], "survival-data");
        assert_eq!(config.file_root, "/srv/games");
        assert_eq!(config.rcon.port, 25575);
        assert_eq!(config.security.allow_actions, vec!["STATS", "LIST"]);
        assert_eq!(config.security.command_allowlist, vec!["say ", "list"]);
    }

    #[test]
    fn shipped_example_loads() {
        let config = AgentConfig::from_yaml(include_str!("../config.example.yaml")).unwrap();
        assert_eq!(config.agent_id, "host-01");
        assert_eq!(config.rcon.port, 25575);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn missing_identity_is_rejected() {
        let err = AgentConfig::from_yaml("token: k\nwsUrl: ws://x\n").unwrap_err();
        assert!(err.contains("agentId"));
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.rcon.password = "hunter2".to_string();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("token: \"k\""));
        assert!(rendered.contains("[REDACTED]"));
    }
}

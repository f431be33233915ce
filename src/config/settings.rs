use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub deploy: DeploySettings,
}

/// Wall-clock budgets per task kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_secs: u64,
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_test_timeout() -> u64 {
    60
}

fn default_deploy_timeout() -> u64 {
    900
}

fn default_connect_timeout() -> u64 {
    120
}

fn default_chat_timeout() -> u64 {
    300
}

fn default_disconnect_timeout() -> u64 {
    30
}

fn default_cancel_grace() -> u64 {
    5000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            test_timeout_secs: default_test_timeout(),
            deploy_timeout_secs: default_deploy_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            chat_timeout_secs: default_chat_timeout(),
            disconnect_timeout_secs: default_disconnect_timeout(),
            cancel_grace_ms: default_cancel_grace(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl RunnerSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
}

fn default_handshake_timeout() -> u64 {
    30_000
}

fn default_command_timeout() -> u64 {
    600
}

fn default_keepalive() -> u32 {
    20
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            command_timeout_secs: default_command_timeout(),
            keepalive_interval: default_keepalive(),
        }
    }
}

impl SshSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Preferred local port is `remote port + port_offset`
    #[serde(default = "default_port_offset")]
    pub port_offset: u16,
    #[serde(default = "default_search_window")]
    pub port_search_window: u16,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_sanity_routes")]
    pub sanity_routes: Vec<String>,
}

fn default_port_offset() -> u16 {
    1000
}

fn default_search_window() -> u16 {
    100
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_health_interval() -> u64 {
    30_000
}

fn default_health_timeout() -> u64 {
    10_000
}

fn default_sanity_routes() -> Vec<String> {
    vec!["/v1/models".to_string(), "/api/tags".to_string()]
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            port_offset: default_port_offset(),
            port_search_window: default_search_window(),
            settle_delay_ms: default_settle_delay(),
            health_interval_ms: default_health_interval(),
            health_timeout_ms: default_health_timeout(),
            sanity_routes: default_sanity_routes(),
        }
    }
}

impl TunnelSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "llama2:7b".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LlmSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    /// Custom deploy script; the bundled one is uploaded when unset
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_models() -> Vec<String> {
    vec![default_model()]
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            script_path: None,
            listen_host: default_listen_host(),
            models: default_models(),
        }
    }
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: AppSettings = toml::from_str(
            r#"
            [tunnel]
            port_offset = 5
            "#,
        )
        .unwrap();
        assert_eq!(settings.tunnel.port_offset, 5);
        assert_eq!(settings.tunnel.port_search_window, 100);
        assert_eq!(settings.ssh.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(settings.runner.deploy_timeout_secs, 900);
        assert_eq!(settings.llm.default_model, "llama2:7b");
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(dir.path()).unwrap();
        assert!(dir.path().join("config.toml").exists());
        assert_eq!(settings.tunnel.health_interval(), Duration::from_secs(30));

        let reloaded = AppSettings::load(dir.path()).unwrap();
        assert_eq!(reloaded.tunnel.sanity_routes, settings.tunnel.sanity_routes);
    }
}

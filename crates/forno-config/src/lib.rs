use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub agent: Agent,
    pub gateway: Gateway,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub store_id: String,
    /// Recent-event window fed into the context builder. The upstream
    /// service pinned this at 100 with no recorded rationale, so it stays
    /// configurable instead of hard-coded.
    #[serde(default = "default_context_event_limit")]
    pub context_event_limit: usize,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    pub instance: String,
    pub token: String,
    #[serde(default = "default_client_token_env")]
    pub client_token_env: String,
    #[serde(default)]
    pub delay_typing_ms: Option<u64>,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_context_event_limit() -> usize {
    100
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_agent_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_agent_timeout_ms() -> u64 {
    30_000
}

fn default_gateway_base_url() -> String {
    "https://api.z-api.io".to_string()
}

fn default_client_token_env() -> String {
    "ZAPI_CLIENT_TOKEN".to_string()
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.agent.store_id.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "agent.store_id must not be empty".to_string(),
        ));
    }
    if cfg.agent.context_event_limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "agent.context_event_limit must be >= 1".to_string(),
        ));
    }
    if !(0.0..=2.0).contains(&cfg.agent.temperature) {
        return Err(ConfigError::UnsupportedConfig(
            "agent.temperature must be within 0.0..=2.0".to_string(),
        ));
    }
    if cfg.agent.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "agent.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.gateway.instance.trim().is_empty() || cfg.gateway.token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gateway.instance and gateway.token must not be empty".to_string(),
        ));
    }
    if cfg.gateway.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gateway.timeout_ms must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("forno-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

agent:
  store_id: "store-test"

gateway:
  instance: "instance-test"
  token: "token-test"
"#
        .to_string()
    }

    #[test]
    fn accepts_minimal_config_and_applies_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("minimal config should be accepted");
        assert_eq!(cfg.agent.context_event_limit, 100);
        assert_eq!(cfg.agent.model, "gpt-4o-mini");
        assert_eq!(cfg.agent.api_key_env, "OPENAI_API_KEY");
        assert_eq!(cfg.gateway.base_url, "https://api.z-api.io");
        assert_eq!(cfg.gateway.delay_typing_ms, None);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_context_event_limit() {
        let path = write_temp_config(&base_yaml().replace(
            "store_id: \"store-test\"",
            "store_id: \"store-test\"\n  context_event_limit: 0",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_empty_gateway_instance() {
        let path = write_temp_config(
            &base_yaml().replace("instance: \"instance-test\"", "instance: \"  \""),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }
}

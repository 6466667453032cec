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
    #[error("environment override invalid: {0}")]
    EnvOverride(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

pub const HOP_NAMES: [&str; 4] = ["transcription", "understanding", "dialogue", "synthesis"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub downstream: Downstream,
    #[serde(default)]
    pub synthesis: Synthesis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    #[serde(default = "default_hops")]
    pub hops: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Downstream {
    pub understanding_addr: String,
    pub dialogue_addr: String,
    pub synthesis_addr: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    #[serde(default = "default_voice")]
    pub default_voice: String,
}

impl Default for Synthesis {
    fn default() -> Self {
        Self {
            default_voice: default_voice(),
        }
    }
}

fn default_hops() -> Vec<String> {
    HOP_NAMES.iter().map(|v| v.to_string()).collect()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_voice() -> String {
    "default".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let mut cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_env_overrides(&mut cfg)?;
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

fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    if let Some(v) = env_value("SWITCHBOARD_LISTEN_ADDR") {
        cfg.server.listen_addr = v;
    }
    if let Some(v) = env_value("SWITCHBOARD_UNDERSTANDING_ADDR") {
        cfg.downstream.understanding_addr = v;
    }
    if let Some(v) = env_value("SWITCHBOARD_DIALOGUE_ADDR") {
        cfg.downstream.dialogue_addr = v;
    }
    if let Some(v) = env_value("SWITCHBOARD_SYNTHESIS_ADDR") {
        cfg.downstream.synthesis_addr = v;
    }
    if let Some(v) = env_value("SWITCHBOARD_REQUEST_TIMEOUT_MS") {
        cfg.downstream.request_timeout_ms = v.parse().map_err(|_| {
            ConfigError::EnvOverride(format!(
                "SWITCHBOARD_REQUEST_TIMEOUT_MS={v} is not a millisecond count"
            ))
        })?;
    }
    Ok(())
}

fn env_value(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
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
    if cfg.server.hops.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "server.hops must name at least one hop".to_string(),
        ));
    }
    for hop in &cfg.server.hops {
        if !HOP_NAMES.contains(&hop.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "server.hops entry {hop} is unknown; supported: transcription, understanding, dialogue, synthesis"
            )));
        }
    }
    if cfg.downstream.request_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "downstream.request_timeout_ms must be >= 1".to_string(),
        ));
    }
    for (key, addr) in [
        ("downstream.understanding_addr", &cfg.downstream.understanding_addr),
        ("downstream.dialogue_addr", &cfg.downstream.dialogue_addr),
        ("downstream.synthesis_addr", &cfg.downstream.synthesis_addr),
    ] {
        if !addr.starts_with("http://") && !addr.starts_with("https://") {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{key}={addr} must be an http(s) URL"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("switchboard-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

downstream:
  understanding_addr: "http://127.0.0.1:8080"
  dialogue_addr: "http://127.0.0.1:8080"
  synthesis_addr: "http://127.0.0.1:8080"
"#
        .to_string()
    }

    #[test]
    fn loads_base_config_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should load");
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:0");
        assert_eq!(cfg.server.hops, HOP_NAMES.to_vec());
        assert_eq!(cfg.downstream.request_timeout_ms, 10_000);
        assert_eq!(cfg.synthesis.default_voice, "default");
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./sessions.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./sessions.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./sessions.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_store_kind() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_temp_config(&base_yaml().replace("type: \"memory\"", "type: \"redis\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_hop_name() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_temp_config(&base_yaml().replace(
            "listen_addr: \"127.0.0.1:0\"",
            "listen_addr: \"127.0.0.1:0\"\n  hops: [\"dialogue\", \"routing\"]",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_non_url_downstream_address() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_temp_config(
            &base_yaml().replace("http://127.0.0.1:8080\"\n  dialogue", "127.0.0.1:8080\"\n  dialogue"),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_top_level_section() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_temp_config(&(base_yaml() + "\nrouting:\n  queue: \"general\"\n"));
        let err = load_and_validate(&path).expect_err("expected schema rejection");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn env_overrides_replace_addresses_and_timeout() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("SWITCHBOARD_DIALOGUE_ADDR", "http://10.0.0.5:9000");
        std::env::set_var("SWITCHBOARD_REQUEST_TIMEOUT_MS", "2500");
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path);
        std::env::remove_var("SWITCHBOARD_DIALOGUE_ADDR");
        std::env::remove_var("SWITCHBOARD_REQUEST_TIMEOUT_MS");

        let cfg = cfg.expect("config with env overrides should load");
        assert_eq!(cfg.downstream.dialogue_addr, "http://10.0.0.5:9000");
        assert_eq!(cfg.downstream.request_timeout_ms, 2_500);
        assert_eq!(cfg.downstream.understanding_addr, "http://127.0.0.1:8080");
    }

    #[test]
    fn rejects_malformed_timeout_override() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("SWITCHBOARD_REQUEST_TIMEOUT_MS", "soon");
        let path = write_temp_config(&base_yaml());
        let err = load_and_validate(&path);
        std::env::remove_var("SWITCHBOARD_REQUEST_TIMEOUT_MS");
        assert!(matches!(
            err.expect_err("expected env override rejection"),
            ConfigError::EnvOverride(_)
        ));
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_llm::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_PERSONA, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{ConfigExtractSnafu, ServerResult};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DATA_DIRECTORY_NAME: &str = "murmur";
pub const DATABASE_FILE_NAME: &str = "murmur.sqlite3";
pub const CONFIG_FILE_NAME: &str = "murmur.json";
pub const CONFIG_PATH_ENV: &str = "MURMUR_CONFIG";
pub const ENV_PREFIX: &str = "MURMUR_";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            persona: default_persona(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint, &self.model)
            .with_persona(self.persona.clone())
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_max_retries(self.max_retries)
    }

    fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        self.persona = self.persona.trim().to_string();
        // A zero timeout would fail every request before it is sent.
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub llm: LlmSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database_path: default_database_path(),
            llm: LlmSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(DATA_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    /// `MURMUR_CONFIG` when set, otherwise `murmur.json` in the working directory.
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }

    /// Defaults, then the JSON file, then `MURMUR_*` variables (`__` nests).
    pub fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> ServerResult<Self> {
        let config_path = Self::config_path();
        if !config_path.exists() {
            tracing::info!(path = ?config_path, "config file not found, using defaults and environment");
        }
        Self::from_figment(Self::figment(&config_path))
    }

    pub fn from_figment(figment: Figment) -> ServerResult<Self> {
        let config = figment
            .extract::<Self>()
            .map_err(Box::new)
            .context(ConfigExtractSnafu {
                stage: "extract-server-config",
            })?;
        Ok(config.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.bind_address = non_blank_or(self.bind_address, default_bind_address);
        self.database_path = non_blank_or(self.database_path, default_database_path);
        self.llm = self.llm.normalized();
        self
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_database_path() -> String {
    ServerConfig::default_data_dir()
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(json: &str) -> ServerConfig {
        let figment =
            Figment::from(Serialized::defaults(ServerConfig::default())).merge(Json::string(json));
        ServerConfig::from_figment(figment).expect("config extracts")
    }

    #[test]
    fn defaults_need_no_credential() {
        let config = from_json("{}");
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert!(config.database_path.ends_with(DATABASE_FILE_NAME));
        assert_eq!(config.llm.api_key, "");
        assert_eq!(config.llm.request_timeout_secs, 60);
        assert_eq!(config.llm.max_retries, 2);
        assert!(!config.llm.to_provider_config().has_api_key());
    }

    #[test]
    fn file_values_override_defaults_and_are_trimmed() {
        let config = from_json(
            r#"{
                "bind_address": " 0.0.0.0:9000 ",
                "llm": { "api_key": " sk-test ", "endpoint": "https://llm.test/v1/", "model": "", "max_retries": 0 }
            }"#,
        );
        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.llm.api_key, "sk-test");
        assert_eq!(config.llm.model, DEFAULT_MODEL);
        assert_eq!(config.llm.max_retries, 0);

        let provider = config.llm.to_provider_config();
        assert_eq!(provider.endpoint, "https://llm.test/v1");
        assert_eq!(provider.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let config = from_json(r#"{ "llm": { "request_timeout_secs": 0 } }"#);
        assert_eq!(config.llm.request_timeout_secs, 60);
    }
}

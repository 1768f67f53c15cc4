//! Session configuration loaded from `lambda-live.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lambda_live_bridge::{BridgeConfig, MqttConfig, PayloadStore, StorageError, Topics};
use lambda_live_proto::CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE: &str = "lambda-live.toml";
pub const DEFAULT_RUNTIME_PORT: u16 = 12557;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No {CONFIG_FILE} found (looked in {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for `{field}`: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub service: String,
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Attach mode: one externally started runtime client serves every
    /// remote instance of a function.
    #[serde(default)]
    pub debug: bool,
    pub broker: BrokerSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSettings>,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
    /// Directory the configuration was loaded from. Relative paths resolve
    /// against it.
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_true")]
    pub gzip: bool,
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Runtime identifier such as `go1.x` or `provided.al2`.
    pub runtime: String,
    /// Handler source path, relative to the service root.
    pub handler: String,
    /// Replaces the default build command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

fn default_stage() -> String {
    "dev".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_threshold_bytes() -> usize {
    lambda_live_proto::STORAGE_THRESHOLD
}

fn default_port() -> u16 {
    DEFAULT_RUNTIME_PORT
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".serverless/artifacts")
}

impl Config {
    /// Candidate configuration files, in lookup order.
    pub fn search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit {
            return vec![path.to_path_buf()];
        }
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("lambda-live").join(CONFIG_FILE));
        }
        paths
    }

    /// Loads the first configuration file that exists.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let searched = Self::search_paths(explicit);
        match searched.iter().find(|p| p.is_file()) {
            Some(path) => Self::load(path),
            None => Err(ConfigError::NotFound { searched }),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self::from_toml(&contents, root).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(contents: &str, root: PathBuf) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(CONFIG_FILE),
            source,
        })?;
        config.root = root;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.trim().is_empty() {
            return Err(ConfigError::invalid("service", "must not be empty"));
        }
        if self.stage.trim().is_empty() {
            return Err(ConfigError::invalid("stage", "must not be empty"));
        }
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::invalid("broker.url", "must not be empty"));
        }
        if self.broker.client_cert.is_some() != self.broker.client_key.is_some() {
            return Err(ConfigError::invalid(
                "broker.client_cert",
                "client_cert and client_key must be set together",
            ));
        }
        if self.build.concurrency == 0 {
            return Err(ConfigError::invalid("build.concurrency", "must be at least 1"));
        }
        if let Some(storage) = &self.storage {
            if storage.bucket.trim().is_empty() {
                return Err(ConfigError::invalid("storage.bucket", "must not be empty"));
            }
            if storage.threshold_bytes == 0 {
                return Err(ConfigError::invalid(
                    "storage.threshold_bytes",
                    "must be greater than zero",
                ));
            }
        }
        for (id, function) in &self.functions {
            if function.runtime.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("functions.{id}.runtime"),
                    "must not be empty",
                ));
            }
            if function.handler.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("functions.{id}.handler"),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.service, &self.stage)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(&self.build.artifacts_dir)
    }

    pub fn function(&self, function_id: &str) -> Option<&FunctionConfig> {
        self.functions.get(function_id)
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            chunk_size: CHUNK_SIZE,
            threshold: self
                .storage
                .as_ref()
                .map_or(lambda_live_proto::STORAGE_THRESHOLD, |s| s.threshold_bytes),
        }
    }

    pub fn mqtt_config(&self, client_id: &str) -> MqttConfig {
        let resolve = |p: &PathBuf| self.root.join(p);
        let mut mqtt = MqttConfig::new(self.broker.url.clone(), client_id);
        mqtt.keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        mqtt.ca_cert = self.broker.ca_cert.as_ref().map(resolve);
        mqtt.client_cert = self.broker.client_cert.as_ref().map(resolve);
        mqtt.client_key = self.broker.client_key.as_ref().map(resolve);
        mqtt
    }

    pub fn payload_store(&self) -> Result<Option<PayloadStore>, StorageError> {
        self.storage
            .as_ref()
            .map(|s| PayloadStore::s3(&s.bucket, s.region.as_deref(), s.endpoint.as_deref(), s.gzip))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MINIMAL: &str = r#"
service = "todos"

[broker]
url = "mqtts://iot.example.com"
"#;

    #[test]
    fn defaults_are_applied() {
        let config = Config::from_toml(MINIMAL, PathBuf::from("/srv/todos")).unwrap();

        assert_eq!(config.stage, "dev");
        assert!(!config.debug);
        assert_eq!(config.runtime.port, 12557);
        assert_eq!(config.runtime.host, "127.0.0.1");
        assert_eq!(config.build.concurrency, 4);
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert!(config.storage.is_none());
        assert_eq!(
            config.artifacts_dir(),
            PathBuf::from("/srv/todos/.serverless/artifacts")
        );
        assert_eq!(config.topics().events(), "serverless/todos/dev/events");
        assert_eq!(config.bridge_config(), BridgeConfig::default());
    }

    #[test]
    fn full_file_parses() {
        let toml = r#"
service = "todos"
stage = "prod"
debug = true

[broker]
url = "mqtts://iot.example.com:8883"
ca_cert = "certs/ca.pem"
client_cert = "certs/client.pem"
client_key = "certs/client.key"

[storage]
bucket = "live-payloads"
region = "eu-west-1"
gzip = false
threshold_bytes = 2048

[runtime]
port = 9001

[build]
concurrency = 2

[functions.api]
runtime = "go1.x"
handler = "cmd/api/main.go"
build = "GOOS=linux go build -tags lambda"
environment = { TABLE = "todos" }
"#;
        let config = Config::from_toml(toml, PathBuf::from("/srv")).unwrap();

        assert!(config.debug);
        assert_eq!(config.runtime.port, 9001);
        assert_eq!(config.bridge_config().threshold, 2048);
        let api = config.function("api").unwrap();
        assert_eq!(api.runtime, "go1.x");
        assert_eq!(api.environment.get("TABLE").map(String::as_str), Some("todos"));

        let mqtt = config.mqtt_config("client-1");
        assert_eq!(mqtt.ca_cert, Some(PathBuf::from("/srv/certs/ca.pem")));
        assert_eq!(mqtt.client_id, "client-1");
    }

    #[rstest]
    #[case::empty_service("service = \"\"\n[broker]\nurl = \"mqtt://h\"", "service")]
    #[case::zero_concurrency(
        "service = \"s\"\n[broker]\nurl = \"mqtt://h\"\n[build]\nconcurrency = 0",
        "build.concurrency"
    )]
    #[case::lone_client_cert(
        "service = \"s\"\n[broker]\nurl = \"mqtt://h\"\nclient_cert = \"c.pem\"",
        "broker.client_cert"
    )]
    #[case::function_without_handler(
        "service = \"s\"\n[broker]\nurl = \"mqtt://h\"\n[functions.f]\nruntime = \"go1.x\"\nhandler = \"\"",
        "functions.f.handler"
    )]
    fn invalid_values_name_the_field(#[case] toml: &str, #[case] expected: &str) {
        let err = Config::from_toml(toml, PathBuf::from(".")).unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, expected),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_resolves_root_from_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.root, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn missing_explicit_file_is_reported() {
        let err = Config::discover(Some(Path::new("/nonexistent/lambda-live.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn serialized_config_parses_back() {
        let config = Config::from_toml(MINIMAL, PathBuf::from(".")).unwrap();
        let text = config.to_toml().unwrap();
        let again = Config::from_toml(&text, PathBuf::from(".")).unwrap();
        assert_eq!(config, again);
    }
}

//! # Configuration Module
//!
//! Declarative gateway configuration: listeners, logging, hot reload settings, service
//! endpoints, API endpoints and pipelines.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde (`.json` files are JSON, everything else YAML)
//! - Environment variable overrides following `GATEWAY_<SECTION>_<FIELD>`
//! - Validation that collects every problem into one configuration error
//! - Declaration order of `apiEndpoints`, `pipelines` and policy blocks is preserved,
//!   because route precedence is decided by config order

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::conditions::ConditionSpec;
use crate::core::error::{GatewayError, GatewayResult};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Plain HTTP listener
    #[serde(default)]
    pub http: Option<HttpConfig>,

    /// HTTPS listener with SNI certificate selection
    #[serde(default)]
    pub https: Option<HttpsConfig>,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Hot reload settings
    #[serde(default)]
    pub hot_reload: HotReloadConfig,

    /// Optional whitelist of policy names pipelines may use
    #[serde(default)]
    pub policies: Option<Vec<String>>,

    /// Named upstream services used by the proxy policy
    #[serde(default)]
    pub service_endpoints: HashMap<String, ServiceEndpointConfig>,

    /// Routing rules, in declaration order
    #[serde(default)]
    pub api_endpoints: Option<NamedMap<ApiEndpointEntry>>,

    /// Pipelines, in declaration order
    #[serde(default)]
    pub pipelines: Option<NamedMap<PipelineDefinition>>,
}

/// A map that keeps its entries in document order
#[derive(Debug, Clone, PartialEq)]
pub struct NamedMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> NamedMap<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Append an entry, replacing any existing entry with the same name in place
    pub fn insert<S: Into<String>>(&mut self, name: S, value: T) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for NamedMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Into<String>, T> FromIterator<(S, T)> for NamedMap<T> {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        let mut map = NamedMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

impl<T: Serialize> Serialize for NamedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NamedMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for NamedMapVisitor<T> {
            type Value = NamedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of named entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, T>()? {
                    if entries.iter().any(|(existing, _)| *existing == name) {
                        return Err(de::Error::custom(format!("duplicate entry '{}'", name)));
                    }
                    entries.push((name, value));
                }
                Ok(NamedMap { entries })
            }
        }

        deserializer.deserialize_map(NamedMapVisitor(PhantomData))
    }
}

/// A value that may be written either as a single item or as a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

/// Plain HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            hostname: default_hostname(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// HTTPS listener configuration
///
/// `tls` maps hostname globs to certificate files. The entry named `default` is used
/// when no glob matches the SNI server name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpsConfig {
    #[serde(default = "default_https_port")]
    pub port: u16,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub tls: NamedMap<TlsCertificateConfig>,

    /// PEM bundle of CAs trusted for client certificates; unset disables client auth
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
}

/// Certificate/key file pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCertificateConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Hot reload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period after the last change notification before rebuilding
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: default_debounce(),
        }
    }
}

/// Upstream service definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceEndpointConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub urls: Vec<String>,
}

impl ServiceEndpointConfig {
    /// All configured upstream URLs, `url` first
    pub fn all_urls(&self) -> Vec<&str> {
        self.url
            .iter()
            .map(String::as_str)
            .chain(self.urls.iter().map(String::as_str))
            .collect()
    }
}

/// One `apiEndpoints` entry, either a single rule or several
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiEndpointEntry {
    Single(ApiEndpointDefinition),
    Multi(Vec<ApiEndpointDefinition>),
}

impl ApiEndpointEntry {
    pub fn definitions(&self) -> Vec<&ApiEndpointDefinition> {
        match self {
            ApiEndpointEntry::Single(definition) => vec![definition],
            ApiEndpointEntry::Multi(definitions) => definitions.iter().collect(),
        }
    }
}

/// Host/path/method pattern of one routing rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiEndpointDefinition {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub host_regex: Option<String>,

    #[serde(default)]
    pub paths: Option<OneOrMany<String>>,

    #[serde(default)]
    pub path_regex: Option<String>,

    #[serde(default)]
    pub methods: Option<OneOrMany<String>>,

    /// Opaque metadata passed through to policies
    #[serde(default)]
    pub scopes: Option<OneOrMany<String>>,
}

/// A named, ordered list of policy blocks bound to API endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    #[serde(default)]
    pub api_endpoints: Vec<String>,

    #[serde(default)]
    pub policies: Vec<PolicyBlock>,
}

/// One element of a pipeline's `policies` list: `{<policy name>: [steps...]}`
pub type PolicyBlock = NamedMap<Vec<PolicyStep>>;

/// One condition/action pair inside a policy block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyStep {
    #[serde(default)]
    pub condition: Option<ConditionSpec>,

    #[serde(default)]
    pub action: ActionSpec,
}

/// Action parameters; `name` selects the policy action, everything else is passed to it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_max_body_size() -> usize {
    16 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_debounce() -> Duration {
    Duration::from_millis(100)
}

impl GatewayConfig {
    /// Load configuration from a file, apply environment overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::parse_json(&content)?
        } else {
            Self::parse_yaml(&content)?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML configuration
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        let config = Self::parse_yaml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON configuration
    pub fn from_json_str(content: &str) -> GatewayResult<Self> {
        let config = Self::parse_json(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    fn parse_json(content: &str) -> GatewayResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_HTTP_PORT=9080
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(port) = env::var("GATEWAY_HTTP_PORT") {
            let http = self.http.get_or_insert_with(HttpConfig::default);
            http.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_HTTP_PORT: {}", e)))?;
        }

        if let Ok(hostname) = env::var("GATEWAY_HTTP_HOSTNAME") {
            self.http.get_or_insert_with(HttpConfig::default).hostname = hostname;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {} (expected json or text)",
                        other
                    )))
                }
            };
        }

        if let Ok(enabled) = env::var("GATEWAY_HOT_RELOAD_ENABLED") {
            self.hot_reload.enabled = enabled
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_HOT_RELOAD_ENABLED: {}", e)))?;
        }

        Ok(())
    }

    /// Structural validation with detailed error messages
    ///
    /// Semantic checks that need the registries (action and condition names) happen
    /// when the configuration is compiled into a dispatch graph.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.api_endpoints.is_none() {
            errors.push("Missing required 'apiEndpoints' section".to_string());
        }
        if self.pipelines.is_none() {
            errors.push("Missing required 'pipelines' section".to_string());
        }

        if let Some(endpoints) = &self.api_endpoints {
            for (name, entry) in endpoints.iter() {
                for definition in entry.definitions() {
                    if definition.host.is_some() && definition.host_regex.is_some() {
                        errors.push(format!(
                            "apiEndpoint '{}' sets both 'host' and 'hostRegex'",
                            name
                        ));
                    }
                    if definition.paths.is_some() && definition.path_regex.is_some() {
                        errors.push(format!(
                            "apiEndpoint '{}' sets both 'paths' and 'pathRegex'",
                            name
                        ));
                    }
                }
            }
        }

        for (name, service) in &self.service_endpoints {
            let urls = service.all_urls();
            if urls.is_empty() {
                errors.push(format!("serviceEndpoint '{}' has no url", name));
            }
            for url in urls {
                if let Err(e) = Url::parse(url) {
                    errors.push(format!("serviceEndpoint '{}' has invalid url '{}': {}", name, url, e));
                }
            }
        }

        if let Some(https) = &self.https {
            if https.tls.is_empty() {
                errors.push("https listener requires at least one 'tls' certificate".to_string());
            }
        }

        if self.hot_reload.debounce.is_zero() && self.hot_reload.enabled {
            errors.push("hotReload.debounce must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(errors.join("; ")))
        }
    }

    /// Whether a policy name may be used by pipelines
    pub fn is_policy_allowed(&self, policy: &str) -> bool {
        match &self.policies {
            Some(allowed) => allowed.iter().any(|p| p == policy),
            None => true,
        }
    }
}

/// Resolve the config file path: first CLI argument, then `GATEWAY_CONFIG_PATH`,
/// then `config/gateway.config.yml`
pub fn resolve_config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATEWAY_CONFIG_PATH").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/gateway.config.yml"))
}

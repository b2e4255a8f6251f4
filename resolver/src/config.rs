use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("connection uri is empty")]
    EmptyUri,
    #[error("max_pool_size must be at least 1")]
    ZeroMaxPoolSize,
    #[error("min_pool_size ({min}) exceeds max_pool_size ({max})")]
    MinExceedsMax { min: u32, max: u32 },
    #[error("connect_timeout_ms must be greater than 0")]
    ZeroConnectTimeout,
}

/// Connection parameters for one backing store. This is both the shape of a
/// metadata authority response and of the statically configured default stores.
#[derive(Clone, Deserialize, PartialEq)]
pub struct DatasourceSettings {
    pub uri: String,
    #[serde(default)]
    pub principal: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_min_pool_size() -> u32 {
    0
}

fn default_max_pool_size() -> u32 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl DatasourceSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.uri.trim().is_empty() {
            return Err(SettingsError::EmptyUri);
        }
        if self.max_pool_size == 0 {
            return Err(SettingsError::ZeroMaxPoolSize);
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(SettingsError::MinExceedsMax {
                min: self.min_pool_size,
                max: self.max_pool_size,
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::ZeroConnectTimeout);
        }
        Ok(())
    }
}

/// The uri with any user info replaced, for logs.
pub(crate) fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            if !url.username().is_empty() || url.password().is_some() {
                // Both only fail for uris without a host, which carry no user info.
                let _ = url.set_password(None);
                let _ = url.set_username("<redacted>");
            }
            url.to_string()
        }
        Err(_) => "<unparseable uri>".to_string(),
    }
}

// Secrets must never reach the logs.
impl fmt::Debug for DatasourceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceSettings")
            .field("uri", &redact_uri(&self.uri))
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

/// Where and how to reach the metadata authority.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetadataConfig {
    pub url: Url,
    #[serde(default = "default_metadata_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

fn default_metadata_timeout_ms() -> u64 {
    2_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_capacity() -> u64 {
    10_000
}

impl MetadataConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct RegistryConfig {
    /// Upper bound on live tenant pools per store kind.
    #[serde(default = "default_max_tenants")]
    pub max_tenants: usize,
    /// How long an evicted pool may keep serving its outstanding leases.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_max_tenants() -> usize {
    1_000
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            max_tenants: default_max_tenants(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

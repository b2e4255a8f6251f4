use hyper::header::HeaderName;
use resolver::StoreKind;
use resolver::config::{DatasourceSettings, MetadataConfig, RegistryConfig, SettingsError};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Main and admin listeners are both bound to {0}")]
    DuplicateListener(String),

    #[error("Invalid tenant header name: {0:?}")]
    InvalidTenantHeader(String),

    #[error("Invalid default {kind} datasource: {source}")]
    InvalidStore {
        kind: StoreKind,
        source: SettingsError,
    },

    #[error("max_tenants must be at least 1")]
    ZeroMaxTenants,

    #[error("Metadata url cannot be used as a base url: {0}")]
    InvalidMetadataUrl(String),
}

/// Gateway configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener serving tenant traffic
    pub listener: Listener,
    /// Listener for health, readiness and pool administration
    pub admin_listener: Listener,
    /// Request header carrying the tenant id
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,
    /// Resolve the tenant's pools before the request reaches the handler, so
    /// resolution failures are reported up front
    #[serde(default = "default_eager_resolve")]
    pub eager_resolve: bool,
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    pub stores: StoresConfig,
}

fn default_tenant_header() -> String {
    "org-id".to_string()
}

fn default_eager_resolve() -> bool {
    true
}

impl Config {
    /// Validates the gateway configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.listener == self.admin_listener {
            return Err(ValidationError::DuplicateListener(format!(
                "{}:{}",
                self.listener.host, self.listener.port
            )));
        }

        self.tenant_header_name()?;

        if self.metadata.url.cannot_be_a_base() {
            return Err(ValidationError::InvalidMetadataUrl(
                self.metadata.url.to_string(),
            ));
        }

        if self.registry.max_tenants == 0 {
            return Err(ValidationError::ZeroMaxTenants);
        }

        self.stores.validate()
    }

    pub fn tenant_header_name(&self) -> Result<HeaderName, ValidationError> {
        HeaderName::from_bytes(self.tenant_header.trim().as_bytes())
            .map_err(|_| ValidationError::InvalidTenantHeader(self.tenant_header.clone()))
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoresConfig {
    pub relational: StoreConfig,
    /// Tenants only get document pools when this is configured.
    pub document: Option<StoreConfig>,
}

impl StoresConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        self.relational.validate(StoreKind::Relational)?;
        if let Some(document) = &self.document {
            document.validate(StoreKind::Document)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Connection settings of the pool serving requests without a tenant
    pub default: DatasourceSettings,
}

impl StoreConfig {
    fn validate(&self, kind: StoreKind) -> Result<(), ValidationError> {
        self.default
            .validate()
            .map_err(|source| ValidationError::InvalidStore { kind, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CONFIG: &str = r#"
        listener:
            host: 0.0.0.0
            port: 3000
        admin_listener:
            host: 127.0.0.1
            port: 3001
        metadata:
            url: http://config-service.internal/
            timeout_ms: 1500
        registry:
            max_tenants: 50
        stores:
            relational:
                default:
                    uri: postgres://db.internal:5432/platform
                    principal: platform
                    secret: hunter2
                    namespace: public
                    max_pool_size: 20
            document:
                default:
                    uri: postgres://docs.internal:5432/platform
                    namespace: documents
    "#;

    fn config() -> Config {
        serde_yaml::from_str(CONFIG).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let config = config();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.port, 3000);
        assert_eq!(config.tenant_header, "org-id");
        assert!(config.eager_resolve);
        assert_eq!(config.metadata.timeout(), Duration::from_millis(1500));
        assert_eq!(config.metadata.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.registry.max_tenants, 50);
        assert_eq!(config.registry.drain_timeout_secs, 30);
        assert_eq!(config.stores.relational.default.max_pool_size, 20);
        assert_eq!(
            config.stores.document.as_ref().unwrap().default.namespace,
            "documents"
        );
        assert_eq!(config.tenant_header_name().unwrap(), "org-id");
    }

    #[test]
    fn test_document_store_is_optional() {
        let yaml = CONFIG.split("            document:").next().unwrap();
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.stores.document.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut c = config();
        c.admin_listener.port = 0;
        assert_eq!(c.validate(), Err(ValidationError::InvalidPort));

        let mut c = config();
        c.admin_listener = c.listener.clone();
        assert_eq!(
            c.validate(),
            Err(ValidationError::DuplicateListener("0.0.0.0:3000".into()))
        );

        let mut c = config();
        c.tenant_header = "".into();
        assert!(matches!(
            c.validate(),
            Err(ValidationError::InvalidTenantHeader(_))
        ));

        let mut c = config();
        c.tenant_header = "org id".into();
        assert!(matches!(
            c.validate(),
            Err(ValidationError::InvalidTenantHeader(_))
        ));

        let mut c = config();
        c.registry.max_tenants = 0;
        assert_eq!(c.validate(), Err(ValidationError::ZeroMaxTenants));

        let mut c = config();
        c.metadata.url = url::Url::parse("mailto:ops@example.com").unwrap();
        assert!(matches!(
            c.validate(),
            Err(ValidationError::InvalidMetadataUrl(_))
        ));

        let mut c = config();
        c.stores.relational.default.max_pool_size = 0;
        assert_eq!(
            c.validate(),
            Err(ValidationError::InvalidStore {
                kind: StoreKind::Relational,
                source: SettingsError::ZeroMaxPoolSize
            })
        );

        let mut c = config();
        c.stores.document.as_mut().unwrap().default.min_pool_size = 50;
        assert_eq!(
            c.validate(),
            Err(ValidationError::InvalidStore {
                kind: StoreKind::Document,
                source: SettingsError::MinExceedsMax { min: 50, max: 10 }
            })
        );
    }
}

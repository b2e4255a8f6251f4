use crate::config::{Config, StoreConfig};
use crate::errors::GatewayError;
use resolver::authority::HttpMetadataSource;
use resolver::config::RegistryConfig;
use resolver::document::DocumentBackend;
use resolver::relational::RelationalBackend;
use resolver::{
    Backend, ConnectionMetadata, MetadataClient, PoolRegistry, RoutingFacade, TenantId,
    TenantPools,
};
use std::sync::Arc;

/// One routing facade per configured store kind, sharing a metadata client.
pub struct Datasources {
    pub relational: Arc<RoutingFacade<RelationalBackend>>,
    pub document: Option<Arc<RoutingFacade<DocumentBackend>>>,
}

impl Datasources {
    /// Connects to the metadata authority and provisions every default pool.
    pub async fn bootstrap(config: &Config) -> Result<Self, GatewayError> {
        let source = HttpMetadataSource::new(config.metadata.url.clone(), config.metadata.timeout())?;
        let metadata = Arc::new(MetadataClient::new(
            Arc::new(source),
            config.metadata.cache_ttl(),
            config.metadata.cache_capacity,
        ));

        let relational = build_facade(
            RelationalBackend,
            metadata.clone(),
            &config.registry,
            &config.stores.relational,
        )
        .await?;

        let document = match &config.stores.document {
            Some(store) => {
                match build_facade(DocumentBackend, metadata, &config.registry, store).await {
                    Ok(facade) => Some(facade),
                    Err(err) => {
                        relational.close_all().await;
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        Ok(Datasources {
            relational,
            document,
        })
    }

    pub fn pools(&self) -> Vec<Arc<dyn TenantPools>> {
        let mut pools: Vec<Arc<dyn TenantPools>> = Vec::new();
        pools.push(self.relational.clone());
        if let Some(document) = &self.document {
            pools.push(document.clone());
        }
        pools
    }
}

pub async fn build_facade<B: Backend>(
    backend: B,
    metadata: Arc<MetadataClient>,
    registry_config: &RegistryConfig,
    store: &StoreConfig,
) -> Result<Arc<RoutingFacade<B>>, GatewayError> {
    let registry = Arc::new(PoolRegistry::new(
        Arc::new(backend),
        metadata,
        registry_config.clone(),
    ));
    let default = ConnectionMetadata::from_settings(
        TenantId::default_tenant(),
        registry.kind(),
        store.default.clone(),
    )?;

    Ok(Arc::new(RoutingFacade::new(registry, default).await?))
}

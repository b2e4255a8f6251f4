use crate::config::DatasourceSettings;
use crate::metadata::{ConnectionMetadata, MetadataError, MetadataSource, StoreKind};
use crate::tenant::TenantId;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum AuthorityError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("could not build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Metadata source backed by the configuration service.
///
/// Serves `GET {base}/tenants/{tenant}/datasources/{kind}` and expects a
/// [`DatasourceSettings`] JSON document in return. A 404 means the tenant has no
/// datasource of that kind; every other failure is reported as unavailable.
pub struct HttpMetadataSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpMetadataSource {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, AuthorityError> {
        if base_url.cannot_be_a_base() {
            return Err(AuthorityError::InvalidUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(HttpMetadataSource { client, base_url })
    }

    fn datasource_url(&self, tenant: &TenantId, kind: StoreKind) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["tenants", tenant.as_str(), "datasources", kind.as_str()]);
        }
        url
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(
        &self,
        tenant: &TenantId,
        kind: StoreKind,
    ) -> Result<ConnectionMetadata, MetadataError> {
        let url = self.datasource_url(tenant, kind);
        tracing::debug!(%tenant, %kind, %url, "fetching datasource metadata");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MetadataError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(MetadataError::TenantNotFound {
                    tenant: tenant.clone(),
                    kind,
                });
            }
            status => {
                return Err(MetadataError::Unavailable(format!(
                    "metadata authority returned {status}"
                )));
            }
        }

        let settings = response
            .json::<DatasourceSettings>()
            .await
            .map_err(|e| MetadataError::Unavailable(format!("malformed response: {e}")))?;

        ConnectionMetadata::from_settings(tenant.clone(), kind, settings)
            .map_err(|e| MetadataError::Unavailable(format!("invalid datasource settings: {e}")))
    }
}

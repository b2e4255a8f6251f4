use crate::errors::{error_response, resolve_error_response};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use resolver::{Backend, RoutingFacade, StoreKind, TenantId};
use serde::Serialize;
use shared::http::{ResponseBody, make_error_response, make_json_response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Serialize)]
struct ProbeResponse {
    tenant: TenantId,
    kind: StoreKind,
    namespace: String,
}

/// `GET /datasource`: borrows the current tenant's pool and runs a round trip on it.
/// Knows nothing about tenancy beyond what the facade hands back.
pub struct DatasourceProbe<B: Backend> {
    facade: Arc<RoutingFacade<B>>,
}

impl<B: Backend> DatasourceProbe<B> {
    pub fn new(facade: Arc<RoutingFacade<B>>) -> Self {
        Self { facade }
    }
}

impl<B: Backend, ReqBody> Service<Request<ReqBody>> for DatasourceProbe<B> {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<ReqBody>) -> Self::Future {
        let is_probe = req.method() == Method::GET && req.uri().path() == "/datasource";
        let facade = self.facade.clone();

        Box::pin(async move {
            if !is_probe {
                return Ok(make_error_response(StatusCode::NOT_FOUND));
            }
            Ok(probe(&facade).await)
        })
    }
}

async fn probe<B: Backend>(facade: &RoutingFacade<B>) -> Response<ResponseBody> {
    let lease = match facade.acquire().await {
        Ok(lease) => lease,
        Err(err) => return resolve_error_response(&err),
    };

    if let Err(err) = facade.registry().backend().ping(&lease).await {
        tracing::warn!(tenant = %lease.tenant(), "datasource probe failed: {err}");
        return error_response(StatusCode::BAD_GATEWAY, err.to_string());
    }

    make_json_response(
        StatusCode::OK,
        &ProbeResponse {
            tenant: lease.tenant().clone(),
            kind: facade.registry().kind(),
            namespace: lease.metadata().namespace.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use resolver::config::RegistryConfig;
    use resolver::testutils::{MockBackend, StaticMetadataSource, test_metadata};
    use resolver::{MetadataClient, PoolRegistry, TenantContext};
    use std::time::Duration;

    async fn probe_service() -> DatasourceProbe<MockBackend> {
        let source = Arc::new(StaticMetadataSource::new());
        source.insert("org-acme", StoreKind::Relational);
        let metadata = Arc::new(MetadataClient::new(source, Duration::from_secs(60), 100));
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(MockBackend::new(StoreKind::Relational)),
            metadata,
            RegistryConfig::default(),
        ));
        let facade = RoutingFacade::new(registry, test_metadata("_default", StoreKind::Relational))
            .await
            .unwrap();
        DatasourceProbe::new(Arc::new(facade))
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn json(response: Response<ResponseBody>) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_probe_reports_current_tenant() {
        let service = probe_service().await;

        let response = TenantContext::scope(TenantId::new("org-acme"), service.call(get("/datasource")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json(response).await,
            serde_json::json!({"tenant": "org-acme", "kind": "relational", "namespace": "org-acme"})
        );
    }

    #[tokio::test]
    async fn test_probe_without_tenant_uses_default() {
        let service = probe_service().await;

        let response = service.call(get("/datasource")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["tenant"], "_default");
    }

    #[tokio::test]
    async fn test_probe_unknown_tenant() {
        let service = probe_service().await;

        let response = TenantContext::scope(TenantId::new("org-ghost"), service.call(get("/datasource")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let service = probe_service().await;
        let response = service.call(get("/other")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

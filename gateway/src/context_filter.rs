//! Binds each request to its tenant.
//!
//! The tenant header is read once per request and the rest of the request, eager
//! resolution and the wrapped service included, runs inside a tenant scope. The
//! scope ends with the request future, so the tenant is gone whether the handler
//! returned, failed or panicked.

use crate::errors::{error_response, resolve_error_response};
use hyper::header::{HeaderMap, HeaderName};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use resolver::{ResolveError, TenantContext, TenantId, TenantPools};
use shared::http::ResponseBody;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub struct TenantContextService<S> {
    inner: Arc<S>,
    header: HeaderName,
    eager: Arc<[Arc<dyn TenantPools>]>,
}

impl<S> TenantContextService<S> {
    /// Wraps `inner`. Every pool set in `eager` is resolved for the request's tenant
    /// before `inner` runs; pass an empty list for lazy resolution. The first set is
    /// the store `inner` serves and must know the tenant. Tenants without a datasource
    /// in the other sets are let through.
    pub fn new(inner: S, header: HeaderName, eager: Vec<Arc<dyn TenantPools>>) -> Self {
        Self {
            inner: Arc::new(inner),
            header,
            eager: eager.into(),
        }
    }
}

/// Absent and blank headers select the default tenant. `None` if the value is not
/// valid text.
fn tenant_from_headers(headers: &HeaderMap, header: &HeaderName) -> Option<TenantId> {
    match headers.get(header) {
        Some(value) => value.to_str().ok().map(TenantId::new),
        None => Some(TenantId::default_tenant()),
    }
}

impl<S, B> Service<Request<B>> for TenantContextService<S>
where
    S: Service<Request<B>, Response = Response<ResponseBody>, Error = Infallible>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let Some(tenant) = tenant_from_headers(req.headers(), &self.header) else {
            let message = format!("{} header is not valid text", self.header);
            return Box::pin(async move { Ok(error_response(StatusCode::BAD_REQUEST, message)) });
        };

        let inner = self.inner.clone();
        let eager = self.eager.clone();

        Box::pin(TenantContext::scope(tenant.clone(), async move {
            for (index, pools) in eager.iter().enumerate() {
                match pools.warm(&tenant).await {
                    Ok(()) => {}
                    Err(ResolveError::TenantNotFound(_)) if index > 0 => {
                        tracing::debug!(%tenant, kind = %pools.kind(), "no datasource of this kind, skipping");
                    }
                    Err(err) => {
                        tracing::debug!(%tenant, kind = %pools.kind(), "eager resolution failed: {err}");
                        return Ok(resolve_error_response(&err));
                    }
                }
            }
            inner.call(req).await
        }))
    }
}

use crate::errors::error_response;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use resolver::{PoolInfo, ShutdownCoordinator, TenantId, TenantPools};
use serde::Serialize;
use shared::http::{ResponseBody, make_error_response, make_json_response};
use shared::probes::probe_response;
use std::borrow::Cow;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Serialize)]
struct PoolsResponse {
    pools: Vec<PoolInfo>,
}

#[derive(Serialize)]
struct EvictResponse {
    tenant: TenantId,
    evicted: bool,
}

/// Operator endpoints: probes, pool listing and eviction.
pub struct AdminService {
    pools: Arc<[Arc<dyn TenantPools>]>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl AdminService {
    pub fn new(pools: Vec<Arc<dyn TenantPools>>, coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self {
            pools: pools.into(),
            coordinator,
        }
    }
}

/// `/pools/{tenant}/evict` -> `{tenant}`, percent-decoded
fn evict_target(path: &str) -> Option<Cow<'_, str>> {
    let segment = path.strip_prefix("/pools/")?.strip_suffix("/evict")?;
    if segment.is_empty() || segment.contains('/') {
        return None;
    }
    urlencoding::decode(segment).ok()
}

impl<B> Service<Request<B>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let is_ready = !self.coordinator.is_shutting_down();
        let pools = self.pools.clone();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            if let Some(response) = probe_response(&path, is_ready) {
                return Ok(response);
            }

            let res = match (method, path.as_str()) {
                (Method::GET, "/pools") => {
                    let pools = pools.iter().flat_map(|p| p.snapshot()).collect();
                    make_json_response(StatusCode::OK, &PoolsResponse { pools })
                }
                (Method::POST, path) => match evict_target(path) {
                    Some(tenant) => evict(&pools, TenantId::new(tenant)).await,
                    None => make_error_response(StatusCode::NOT_FOUND),
                },
                _ => make_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}

async fn evict(pools: &[Arc<dyn TenantPools>], tenant: TenantId) -> Response<ResponseBody> {
    if tenant.is_default() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "the default pool cannot be evicted",
        );
    }

    let mut evicted = false;
    for store in pools {
        evicted |= store.evict(&tenant).await;
    }
    tracing::info!(%tenant, evicted, "eviction requested");

    make_json_response(StatusCode::OK, &EvictResponse { tenant, evicted })
}

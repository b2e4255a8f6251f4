mod admin_service;
pub mod config;
mod context_filter;
pub mod datasources;
pub mod errors;
mod probe_service;

use admin_service::AdminService;
use context_filter::TenantContextService;
use datasources::Datasources;
use probe_service::DatasourceProbe;
use resolver::{ShutdownCoordinator, ShutdownReport};
use shared::http::run_http_service;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

pub use errors::GatewayError;

/// Serves tenant traffic and the admin endpoints until `shutdown` resolves, then
/// stops accepting requests and closes every pool.
pub async fn run<F>(config: config::Config, shutdown: F) -> Result<ShutdownReport, GatewayError>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    let header = config.tenant_header_name()?;

    let datasources = Datasources::bootstrap(&config).await?;
    let pools = datasources.pools();
    let coordinator = Arc::new(ShutdownCoordinator::new(pools.clone()));

    // `pools()` lists the relational store first, which is the one the probe serves.
    let eager = if config.eager_resolve {
        pools.clone()
    } else {
        Vec::new()
    };
    let service = TenantContextService::new(
        DatasourceProbe::new(datasources.relational.clone()),
        header,
        eager,
    );
    let admin = AdminService::new(pools, coordinator.clone());

    let (main_stop, main_stopped) = watch::channel(());
    let (admin_stop, admin_stopped) = watch::channel(());

    let main_task = async {
        run_http_service(
            &config.listener.host,
            config.listener.port,
            service,
            stopped(main_stopped),
        )
        .await
        .map_err(GatewayError::from)
    };
    let admin_task = async {
        run_http_service(
            &config.admin_listener.host,
            config.admin_listener.port,
            admin,
            stopped(admin_stopped),
        )
        .await
        .map_err(GatewayError::from)
    };
    // The admin listener outlives the main one so readiness can be observed while
    // pools are closing.
    let stop_task = async {
        shutdown.await;
        tracing::info!("shutdown requested");
        let _ = main_stop.send(());
        let report = coordinator.shutdown().await;
        let _ = admin_stop.send(());
        Ok::<_, GatewayError>(report)
    };

    match tokio::try_join!(main_task, admin_task, stop_task) {
        Ok(((), (), report)) => Ok(report),
        Err(err) => {
            tracing::error!("gateway failed: {err}");
            coordinator.shutdown().await;
            Err(err)
        }
    }
}

async fn stopped(mut rx: watch::Receiver<()>) {
    // Also resolves if the sender is dropped.
    let _ = rx.changed().await;
}

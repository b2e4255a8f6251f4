use crate::facade::TenantPools;
use crate::registry::ShutdownReport;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;

/// Closes every pool of every store kind when the process stops.
pub struct ShutdownCoordinator {
    pools: Vec<Arc<dyn TenantPools>>,
    started: AtomicBool,
    done: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new(pools: Vec<Arc<dyn TenantPools>>) -> Self {
        ShutdownCoordinator {
            pools,
            started: AtomicBool::new(false),
            done: OnceCell::new(),
        }
    }

    /// Runs the shutdown once. Later and concurrent callers get the first run's report.
    /// Close failures are logged and never stop the remaining closes.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.started.store(true, Ordering::SeqCst);
        self.done
            .get_or_init(|| async {
                let mut report = ShutdownReport::default();
                for pools in &self.pools {
                    report.merge(pools.close_all().await);
                }

                if report.failed.is_empty() {
                    tracing::info!(closed = report.closed, "all pools closed");
                } else {
                    tracing::warn!(
                        closed = report.closed,
                        failed = report.failed.len(),
                        "shutdown finished with pools that failed to close"
                    );
                }
                report
            })
            .await
            .clone()
    }

    /// True from the moment shutdown begins, before the pools are closed.
    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.done.initialized()
    }
}

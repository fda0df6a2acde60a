pub mod condition;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod net;
pub mod push;
pub mod router;
pub mod routes;

use std::sync::Arc;

use config::Config;
use push::{PushCenter, PushScheduler, ReportStore};
use router::RoutingTable;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub routers: Arc<RoutingTable>,
    pub push: Arc<PushCenter>,
    pub reports: Arc<ReportStore>,
}

impl AppState {
    /// Wire up the routing table, scheduler and push center. Must be called
    /// from within a tokio runtime; the scheduler spawns its lanes here.
    pub fn new(config: Config) -> Self {
        let routers = Arc::new(RoutingTable::new());
        let reports = Arc::new(ReportStore::new(config.report_history));
        let scheduler = PushScheduler::start(config.lanes);
        let push = Arc::new(PushCenter::new(
            routers.clone(),
            scheduler,
            config.flow,
            reports.clone(),
        ));
        Self {
            config: Arc::new(config),
            routers,
            push,
            reports,
        }
    }
}

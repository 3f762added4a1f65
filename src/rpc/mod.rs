//! HTTP surface of a replica.
//!
//! Every replica serves the agent RPC. A center additionally serves the
//! forwarding endpoints edge replicas use in place of a store.

mod agent;
mod center;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::center::{
    PATH_MARK_DONE, PATH_RECORD_COUNT, PATH_RECORD_LIST, PATH_TASK_HOST, PATH_TASK_HOSTS_UPSERT,
    PATH_TASK_HOST_OUTPUT, PATH_TASK_META,
};
use crate::error::Result;
use crate::report::Reconciler;
use crate::store::SchedulerStore;

pub const PATH_AGENT_REPORT: &str = "/ibex/v1/agent/report";
pub const PATH_AGENT_META: &str = "/ibex/v1/agent/meta/:id";

/// Build the router. Center endpoints are mounted only when `center` is set.
pub fn router(reconciler: Arc<Reconciler>, center: Option<Arc<dyn SchedulerStore>>) -> Router {
    let agent = Router::new()
        .route(PATH_AGENT_REPORT, post(agent::report_handler))
        .route(PATH_AGENT_META, get(agent::task_meta_handler))
        .with_state(reconciler);

    let app = match center {
        Some(store) => agent.merge(
            Router::new()
                .route(PATH_TASK_META, post(center::create_meta_handler))
                .route(PATH_TASK_HOST, post(center::upsert_host_handler))
                .route(
                    PATH_TASK_HOST.trim_end_matches('/'),
                    post(center::upsert_host_handler),
                )
                .route(PATH_TASK_HOSTS_UPSERT, post(center::upsert_hosts_handler))
                .route(PATH_TASK_HOST_OUTPUT, post(center::host_output_handler))
                .route(PATH_RECORD_LIST, post(center::record_list_handler))
                .route(PATH_RECORD_COUNT, post(center::record_count_handler))
                .route(PATH_MARK_DONE, post(center::mark_done_handler))
                .with_state(store),
        ),
        None => agent,
    };

    app.layer(TraceLayer::new_for_http())
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "RPC server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "RPC server stopped");
    Ok(())
}

//! Center-side endpoints that edge replicas forward their store operations to.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::Serialize;

use crate::center::{Envelope, HostOutput};
use crate::error::Result;
use crate::scheduler::task::{MarkDone, TaskHost, TaskMeta};
use crate::store::{RecordQuery, SchedulerStore, UpsertErrors};

type StoreState = State<Arc<dyn SchedulerStore>>;

fn envelope<T: Serialize + Default>(result: Result<T>) -> Json<Envelope<T>> {
    match result {
        Ok(dat) => Json(Envelope::ok(dat)),
        Err(e) => {
            tracing::warn!(error = %e, "Center request failed");
            Json(Envelope {
                dat: T::default(),
                err: e.to_string(),
            })
        }
    }
}

/// Malformed bodies are answered in the envelope like any other failure.
fn rejected<T: Default>(rejection: JsonRejection) -> Json<Envelope<T>> {
    let err = rejection.body_text();
    tracing::warn!(error = %err, "Rejected center request body");
    Json(Envelope {
        dat: T::default(),
        err,
    })
}

pub(super) async fn create_meta_handler(
    State(store): StoreState,
    payload: std::result::Result<Json<TaskMeta>, JsonRejection>,
) -> Json<Envelope<i64>> {
    let meta = match payload {
        Ok(Json(meta)) => meta,
        Err(rejection) => return rejected(rejection),
    };
    envelope(store.create_task_meta(&meta).await)
}

pub(super) async fn upsert_host_handler(
    State(store): StoreState,
    payload: std::result::Result<Json<TaskHost>, JsonRejection>,
) -> Json<Envelope<()>> {
    let host = match payload {
        Ok(Json(host)) => host,
        Err(rejection) => return rejected(rejection),
    };
    envelope(store.upsert_task_host(&host).await)
}

pub(super) async fn upsert_hosts_handler(
    State(store): StoreState,
    payload: std::result::Result<Json<Vec<TaskHost>>, JsonRejection>,
) -> Json<Envelope<UpsertErrors>> {
    let hosts = match payload {
        Ok(Json(hosts)) => hosts,
        Err(rejection) => return rejected(rejection),
    };
    envelope(store.upsert_task_hosts(&hosts).await)
}

pub(super) async fn host_output_handler(
    State(store): StoreState,
    payload: std::result::Result<Json<HostOutput>, JsonRejection>,
) -> Json<Envelope<()>> {
    let output = match payload {
        Ok(Json(output)) => output,
        Err(rejection) => return rejected(rejection),
    };
    envelope(
        store
            .update_output(output.id, &output.host, &output.stdout, &output.stderr)
            .await,
    )
}

pub(super) async fn record_list_handler(
    State(store): StoreState,
    payload: std::result::Result<Json<RecordQuery>, JsonRejection>,
) -> Json<Envelope<serde_json::Value>> {
    let query = match payload {
        Ok(Json(query)) => query,
        Err(rejection) => return rejected(rejection),
    };
    let result = match query {
        RecordQuery::HostDoing(filter) => store
            .doing_records(&filter)
            .await
            .and_then(|rows| Ok(serde_json::to_value(rows)?)),
        RecordQuery::TaskMeta { id } => store
            .task_meta(id)
            .await
            .and_then(|meta| Ok(serde_json::to_value(meta.into_iter().collect::<Vec<_>>())?)),
    };
    envelope(result)
}

pub(super) async fn record_count_handler(
    State(store): StoreState,
    payload: std::result::Result<Json<RecordQuery>, JsonRejection>,
) -> Json<Envelope<u64>> {
    let query = match payload {
        Ok(Json(query)) => query,
        Err(rejection) => return rejected(rejection),
    };
    let result = match query {
        RecordQuery::HostDoing(filter) => store.count_doing(&filter).await,
        RecordQuery::TaskMeta { id } => store
            .task_meta(id)
            .await
            .map(|meta| u64::from(meta.is_some())),
    };
    envelope(result)
}

pub(super) async fn mark_done_handler(
    State(store): StoreState,
    payload: std::result::Result<Json<MarkDone>, JsonRejection>,
) -> Json<Envelope<()>> {
    let done = match payload {
        Ok(Json(done)) => done,
        Err(rejection) => return rejected(rejection),
    };
    envelope(store.mark_done(&done).await)
}

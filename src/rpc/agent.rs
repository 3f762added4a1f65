use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    Json,
};

use crate::report::{Reconciler, ReportRequest, ReportResponse, TaskMetaResponse};

pub(super) async fn report_handler(
    State(reconciler): State<Arc<Reconciler>>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> Json<ReportResponse> {
    match payload {
        Ok(Json(req)) => Json(reconciler.report(req).await),
        Err(rejection) => Json(ReportResponse {
            message: rejection.body_text(),
            assign_tasks: Vec::new(),
        }),
    }
}

pub(super) async fn task_meta_handler(
    State(reconciler): State<Arc<Reconciler>>,
    id: Result<Path<i64>, PathRejection>,
) -> Json<TaskMetaResponse> {
    match id {
        Ok(Path(id)) => Json(reconciler.get_task_meta(id).await),
        Err(rejection) => Json(TaskMetaResponse {
            message: rejection.body_text(),
            ..TaskMetaResponse::default()
        }),
    }
}

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use supervisor::controller::DEFAULT_LOG_TAIL;
use supervisor::{
    Controller, DefinitionResult, LogTail, OperationResult, RuntimeState, ServiceDefinition,
    ServiceInfo, SupervisorError,
};

/// Failure of a request, rendered as `{"success": false, "error": ...}`.
#[derive(Debug)]
pub struct ApiError(SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(error: SupervisorError) -> Self {
        ApiError(error)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::AlreadyExists(_) => StatusCode::CONFLICT,
            SupervisorError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
pub struct SuccessBody {
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdoptBody {
    success: bool,
    adopted: Vec<String>,
}

#[derive(Deserialize)]
pub struct LogQuery {
    tail: Option<usize>,
}

/// An unknown name is a 404; any other failure of the operation itself is reported
/// in the body with `success: false`.
fn lifecycle(name: &str, result: Result<RuntimeState, SupervisorError>) -> ApiResult<OperationResult> {
    match result {
        Err(e @ SupervisorError::NotFound(_)) => Err(e.into()),
        other => Ok(Json(OperationResult::from_result(name, &other))),
    }
}

pub async fn list_services(State(controller): State<Arc<Controller>>) -> Json<Vec<ServiceInfo>> {
    Json(controller.list_services().await)
}

pub async fn get_service(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
) -> ApiResult<ServiceInfo> {
    Ok(Json(controller.get_service(&name).await?))
}

pub async fn start(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
) -> ApiResult<OperationResult> {
    debug!(service = %name, "start requested");
    lifecycle(&name, controller.start(&name).await)
}

pub async fn stop(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
) -> ApiResult<OperationResult> {
    debug!(service = %name, "stop requested");
    lifecycle(&name, controller.stop(&name).await)
}

pub async fn restart(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
) -> ApiResult<OperationResult> {
    debug!(service = %name, "restart requested");
    lifecycle(&name, controller.restart(&name).await)
}

pub async fn start_all(State(controller): State<Arc<Controller>>) -> Json<Vec<OperationResult>> {
    Json(controller.start_all().await)
}

pub async fn stop_all(State(controller): State<Arc<Controller>>) -> Json<Vec<OperationResult>> {
    Json(controller.stop_all().await)
}

pub async fn restart_all(State(controller): State<Arc<Controller>>) -> Json<Vec<OperationResult>> {
    Json(controller.restart_all().await)
}

pub async fn get_log(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<LogTail> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL);
    Ok(Json(controller.get_log(&name, tail).await?))
}

pub async fn clear_log(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
) -> ApiResult<SuccessBody> {
    controller.clear_log(&name).await?;
    Ok(Json(SuccessBody { success: true }))
}

pub async fn clear_all_logs(State(controller): State<Arc<Controller>>) -> ApiResult<SuccessBody> {
    controller.clear_all_logs().await?;
    Ok(Json(SuccessBody { success: true }))
}

pub async fn add_service(
    State(controller): State<Arc<Controller>>,
    Json(definition): Json<ServiceDefinition>,
) -> ApiResult<DefinitionResult> {
    Ok(Json(controller.add_service(definition).await?))
}

pub async fn update_service(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
    Json(definition): Json<ServiceDefinition>,
) -> ApiResult<DefinitionResult> {
    Ok(Json(controller.update_service(&name, definition).await?))
}

pub async fn remove_service(
    State(controller): State<Arc<Controller>>,
    Path(name): Path<String>,
) -> ApiResult<DefinitionResult> {
    Ok(Json(controller.remove_service(&name).await?))
}

pub async fn adopt_running(State(controller): State<Arc<Controller>>) -> Json<AdoptBody> {
    Json(AdoptBody {
        success: true,
        adopted: controller.adopt_running().await,
    })
}

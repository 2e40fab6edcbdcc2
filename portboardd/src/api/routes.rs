use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use shared::protocol::{FIELD_ICON, HEALTHCHECK_PATH, ICON_UPLOAD_FIELD};
use shared::types::{HostView, OverlayValue, Snapshot};
use crate::engine::CycleState;
use crate::icons::{self, IconError, IconStore};
use crate::overlay::{OverlayError, OverlayHandle};
use crate::view;

#[derive(Clone)]
pub struct AppState {
    pub overlay: OverlayHandle,
    pub snapshots: watch::Receiver<Arc<Snapshot>>,
    pub cycle: watch::Receiver<CycleState>,
    pub icons: IconStore,
    pub started: Instant,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub uptime: f64,
    pub cycle: CycleState,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub filename: String,
}

type ApiError = (StatusCode, String);

pub fn router(state: AppState) -> Router {
    let app = Router::new()
        .route("/", get(get_hosts))
        .route(HEALTHCHECK_PATH, get(healthcheck))
        .route("/ico/:name", get(get_icon))
        .route("/hosts/:address/:field", post(set_host_field))
        .route("/hosts/:address/services/:port/icon", post(upload_icon))
        .route("/hosts/:address/services/:port/:field", post(set_service_field))
        .with_state(state);
    catch_panics(app)
}

/// Answer a panicking handler with a generic 500 instead of dropping the connection
fn catch_panics(app: Router) -> Router {
    app.layer(CatchPanicLayer::custom(panic_response))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!("Request handler panicked: {}", detail);
    (StatusCode::INTERNAL_SERVER_ERROR, "Something broke!").into_response()
}

fn overlay_error(e: OverlayError) -> ApiError {
    match e {
        OverlayError::ReservedField(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        e => {
            tracing::error!("Failed to update overlay: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Something broke!".to_string())
        }
    }
}

async fn get_hosts(State(state): State<AppState>) -> Json<Vec<HostView>> {
    let snapshot = state.snapshots.borrow().clone();
    let overlay = state.overlay.current();
    Json(view::present(&snapshot, &overlay))
}

async fn healthcheck(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        uptime: state.started.elapsed().as_secs_f64(),
        cycle: *state.cycle.borrow(),
    })
}

async fn get_icon(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, StatusCode> {
    let bytes = state
        .icons
        .read(&name)
        .await
        .map_err(|e| {
            tracing::error!("Failed to read icon: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(([(header::CONTENT_TYPE, icons::content_type(&name))], bytes).into_response())
}

async fn set_host_field(
    State(state): State<AppState>,
    Path((address, field)): Path<(String, String)>,
    body: String,
) -> Result<StatusCode, ApiError> {
    state
        .overlay
        .set_field(address, None, field, OverlayValue::from_text(&body))
        .await
        .map_err(overlay_error)?;
    Ok(StatusCode::OK)
}

async fn set_service_field(
    State(state): State<AppState>,
    Path((address, port, field)): Path<(String, u16, String)>,
    body: String,
) -> Result<StatusCode, ApiError> {
    state
        .overlay
        .set_field(address, Some(port), field, OverlayValue::from_text(&body))
        .await
        .map_err(overlay_error)?;
    Ok(StatusCode::OK)
}

async fn upload_icon(
    State(state): State<AppState>,
    Path((address, port)): Path<(String, u16)>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() == Some(ICON_UPLOAD_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            upload = Some(bytes);
            break;
        }
    }
    let bytes = upload.ok_or((StatusCode::BAD_REQUEST, "No file uploaded".to_string()))?;

    let filename = state.icons.store(&bytes).await.map_err(|e| match e {
        IconError::UnknownType => (StatusCode::BAD_REQUEST, e.to_string()),
        e => {
            tracing::error!("Failed to store icon: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Something broke!".to_string())
        }
    })?;

    state
        .overlay
        .set_field(address, Some(port), FIELD_ICON.to_string(), OverlayValue::Text(filename.clone()))
        .await
        .map_err(overlay_error)?;

    tracing::info!("Stored uploaded icon {}", filename);
    Ok(Json(UploadResponse {
        message: "File uploaded".to_string(),
        filename,
    }))
}

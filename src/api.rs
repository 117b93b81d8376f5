use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::{lock, AppState, JobEntry, JobKind, JobOutcome, Status, StatusLevel},
    data_model::{ExperimentContext, ExperimentView},
    job_poller::{CompletedJob, JobError, JobState},
    jobs::{
        ExportMode, ExportOutcome, ExportRequest, PlotOutcome, PlotRequest, UpgradeOutcome, UpgradeRequest,
        EXPORT_SERVICE, FCS_EVENTS_SERVICE, UPGRADE_SERVICE,
    },
    lims::{LimsError, Parameters},
    models::TreeNode,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct ExperimentQuery {
    identifier: String,
    type_code: String,
}

#[derive(Deserialize)]
pub struct ExpandPayload {
    context: ExperimentContext,
    node: TreeNode,
}

#[derive(Serialize)]
pub struct JobAccepted {
    job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    id: Uuid,
    kind: JobKind,
    created_at: DateTime<Utc>,
    state: JobState,
    outcome: Option<JobOutcome>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/experiment", get(experiment_handler))
        .route("/api/tree/expand", post(expand_handler))
        .route("/api/export", post(export_handler))
        .route("/api/plot", post(plot_handler))
        .route("/api/upgrade", post(upgrade_handler))
        .route("/api/jobs/:id", get(job_handler).delete(cancel_job_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn experiment_handler(
    State(state): State<AppState>,
    Query(query): Query<ExperimentQuery>,
) -> Result<Json<ExperimentView>, ApiError> {
    state.set_status("Loading experiment...", StatusLevel::Info, true);

    let view = state
        .data_model
        .load_experiment(&query.identifier, &query.type_code, state.config.experiment_latest_version)
        .await
        .map_err(|e| {
            error!("No se pudo cargar el experimento '{}': {}", query.identifier, e);
            state.set_status(format!("Could not retrieve the experiment: {e}"), StatusLevel::Danger, false);
            let status = match &e {
                LimsError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            api_error(status, e.to_string())
        })?;

    if view.needs_upgrade {
        state.set_status(
            "This experiment is old and needs to be upgraded.",
            StatusLevel::Warning,
            false,
        );
    } else {
        state.clear_status();
    }
    Ok(Json(view))
}

/// Los errores de carga viajan dentro del nodo devuelto, nunca como error HTTP.
#[axum::debug_handler]
async fn expand_handler(
    State(state): State<AppState>,
    Json(payload): Json<ExpandPayload>,
) -> Json<TreeNode> {
    let node = state.data_model.fetch(&payload.context, payload.node).await;
    if node.is_error() {
        warn!("La carga de '{}' terminó con error", node.title);
    }
    Json(node)
}

#[axum::debug_handler]
async fn export_handler(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.mode == ExportMode::Normal && !state.config.enable_export_to_user_folder {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Exporting to the user folder is disabled on this server.",
        ));
    }

    state.set_status(
        "Please wait while processing your request. This might take a while...",
        StatusLevel::Info,
        true,
    );

    let job_id = spawn_job(&state, JobKind::Export, EXPORT_SERVICE, request.to_parameters(), export_outcome);
    info!("Exportación {:?} lanzada como trabajo {}", request.task, job_id);
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

/// Devuelve los datos en caché si ya se pidieron; si no, lanza el trabajo.
#[axum::debug_handler]
async fn plot_handler(
    State(state): State<AppState>,
    Json(request): Json<PlotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let data_key = request.cache_key();
    let cached = lock(&state.plot_cache).get(&request.node_key, &data_key).cloned();
    if let Some(data) = cached {
        return Ok((StatusCode::OK, Json(json!({ "cached": true, "data": data }))));
    }

    state.set_status("Retrieving data for the plot...", StatusLevel::Info, true);
    let job_id = spawn_job(&state, JobKind::Plot, FCS_EVENTS_SERVICE, request.to_parameters(), plot_outcome);
    Ok((StatusCode::ACCEPTED, Json(json!({ "cached": false, "job_id": job_id }))))
}

#[axum::debug_handler]
async fn upgrade_handler(
    State(state): State<AppState>,
    Json(request): Json<UpgradeRequest>,
) -> Result<Json<UpgradeOutcome>, ApiError> {
    state.set_status("Upgrading experiment...", StatusLevel::Info, true);

    let outcome = state
        .poller
        .invoke_once(UPGRADE_SERVICE, request.to_parameters())
        .await
        .and_then(|row| UpgradeOutcome::from_row(&row));

    match outcome {
        Ok(outcome) => {
            let (text, level) = outcome.status();
            state.set_status(text, level, false);
            Ok(Json(outcome))
        }
        Err(err) => {
            error!("Error actualizando el experimento {}: {}", request.exp_sample_perm_id, err);
            state.set_status(err.user_message(), StatusLevel::Danger, false);
            Err(api_error(StatusCode::BAD_GATEWAY, err.user_message()))
        }
    }
}

/// Un trabajo terminado se entrega una sola vez: tras leer su desenlace se
/// elimina del registro.
#[axum::debug_handler]
async fn job_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<JobView>, ApiError> {
    let mut jobs = lock(&state.jobs);
    let entry = jobs
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No existe el trabajo {id}")))?;

    let job_state = entry.progress.borrow().clone();
    let view = JobView {
        id,
        kind: entry.kind,
        created_at: entry.created_at,
        state: job_state,
        outcome: entry.outcome.clone(),
    };
    if view.outcome.is_some() {
        jobs.remove(&id);
    }
    Ok(Json(view))
}

#[axum::debug_handler]
async fn cancel_job_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    let jobs = lock(&state.jobs);
    let entry = jobs
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No existe el trabajo {id}")))?;

    if entry.progress.borrow().is_terminal() {
        return Err(api_error(StatusCode::CONFLICT, format!("El trabajo {id} ya terminó")));
    }

    info!("Cancelando el trabajo {id}");
    entry.cancel.cancel();
    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(lock(&state.status).clone())
}

// --- Handler de Apagado y Utilidades ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    state.shutdown.cancel();
    if let Some(sender) = lock(&state.shutdown_sender).take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

/// Registra el trabajo y lo lanza. `interpret` convierte el resultado final en
/// el desenlace visible y actualiza el estado global.
fn spawn_job<F>(state: &AppState, kind: JobKind, service: &str, parameters: Parameters, interpret: F) -> Uuid
where
    F: FnOnce(&AppState, Result<CompletedJob, JobError>) -> JobOutcome + Send + 'static,
{
    let id = Uuid::new_v4();
    let cancel = state.shutdown.child_token();
    state.prune_finished_jobs(Utc::now());

    // El mapa queda bloqueado hasta registrar la entrada: el desenlace nunca
    // llega antes que su trabajo.
    let mut jobs = lock(&state.jobs);
    let job_state = state.clone();
    let (handle, progress) = state.poller.submit(service, parameters, cancel.clone(), move |result| {
        let outcome = interpret(&job_state, result);
        job_state.finish_job(id, outcome);
    });

    jobs.insert(
        id,
        JobEntry {
            kind,
            created_at: Utc::now(),
            cancel,
            progress,
            outcome: None,
            finished_at: None,
            handle: Some(handle),
        },
    );
    id
}

fn export_outcome(state: &AppState, result: Result<CompletedJob, JobError>) -> JobOutcome {
    match result.and_then(|job| ExportOutcome::from_job(&job)) {
        Ok(outcome) => {
            let (text, level) = outcome.status();
            state.set_status(text, level, false);
            let download_url = outcome.download_url(&state.lims.data_store_url(), &state.lims.session_token());
            JobOutcome::Export {
                result: outcome,
                download_url,
            }
        }
        Err(err) => job_failed(state, err),
    }
}

fn plot_outcome(state: &AppState, result: Result<CompletedJob, JobError>) -> JobOutcome {
    match result.and_then(|job| PlotOutcome::from_job(&job)) {
        Ok(outcome) => {
            match outcome.status() {
                Some((text, level)) => state.set_status(text, level, false),
                None => state.clear_status(),
            }
            if outcome.success {
                lock(&state.plot_cache).insert(outcome.node_key.clone(), outcome.cache_key(), outcome.data.clone());
            }
            JobOutcome::Plot(outcome)
        }
        Err(err) => job_failed(state, err),
    }
}

fn job_failed(state: &AppState, err: JobError) -> JobOutcome {
    let level = match err {
        JobError::Cancelled => StatusLevel::Info,
        _ => StatusLevel::Danger,
    };
    let message = err.user_message();
    state.set_status(message.clone(), level, false);
    JobOutcome::Error { message }
}

use std::sync::{Arc, Mutex};

use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequest, Json, Path, Request, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::spawn;
use tracing::{error, info, warn};

use crate::{
    app_state::{AppState, Status},
    db,
    error::{bad_request, ApiError},
    ingest,
    invoice::{check_required_fields, Invoice},
    reconcile::Analysis,
};

/// Límite de tamaño para los PDF subidos.
const MAX_PDF_BYTES: usize = 20 * 1024 * 1024;
const MISSING_QUERY: &str = "Parâmetro \"query\" é obrigatório.";

// --- Payloads ---

/// `Json<T>` cuyo rechazo también sale con el sobre `{success:false, error}`.
pub struct Payload<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Payload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Payload(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    warn!("Cuerpo JSON rechazado: {}", rejection.body_text());
    (
        rejection.status(),
        Json(json!({
            "success": false,
            "error": format!("Corpo da requisição inválido: {}", rejection.body_text()),
        })),
    )
}

#[derive(Deserialize)]
pub struct QueryPayload {
    query: Option<String>,
}

impl QueryPayload {
    fn query(self) -> Result<String, ApiError> {
        self.query
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| bad_request(MISSING_QUERY))
    }
}

#[derive(Deserialize)]
pub struct AnalyzePayload {
    #[serde(alias = "dadosExtraidos")]
    invoice: Invoice,
}

#[derive(Deserialize)]
pub struct MovementPayload {
    #[serde(alias = "dadosExtraidos")]
    invoice: Invoice,
    #[serde(alias = "analise")]
    analysis: Analysis,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rag/simple", post(rag_simple_handler))
        .route("/rag/embeddings/search", post(embeddings_search_handler))
        .route("/rag/embeddings/index", post(embeddings_index_handler))
        .route("/rag/embeddings/status", get(status_handler))
        .route("/rag/source/:type/:id", get(source_handler))
        .route(
            "/invoices/extract",
            post(invoice_extract_handler).layer(DefaultBodyLimit::max(MAX_PDF_BYTES)),
        )
        .route("/invoices/analyze", post(invoice_analyze_handler))
        .route("/invoices/movements", post(invoice_movement_handler))
        .route("/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let db = match &state.pool {
        Some(pool) => db::ping(pool).await,
        None => false,
    };
    Json(json!({ "ok": true, "service": "agroer-rag", "db": db }))
}

#[axum::debug_handler]
async fn rag_simple_handler(
    State(state): State<AppState>,
    Payload(payload): Payload<QueryPayload>,
) -> Result<Json<Value>, ApiError> {
    let query = payload.query()?;
    let answer = state.rag.answer(&query).await?;
    Ok(Json(json!(answer)))
}

#[axum::debug_handler]
async fn embeddings_search_handler(
    State(state): State<AppState>,
    Payload(payload): Payload<QueryPayload>,
) -> Result<Json<Value>, ApiError> {
    let query = payload.query()?;
    let results = state.rag.search_embeddings(&query).await?;
    Ok(Json(json!({ "success": true, "results": results })))
}

#[axum::debug_handler]
async fn embeddings_index_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    {
        let mut status = state.status();
        if status.is_busy {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({ "success": false, "error": "Indexação já em andamento." })),
            ));
        }
        status.is_busy = true;
        status.message = "Iniciando indexação...".to_string();
        status.progress = 0.0;
    }

    let task_state = state.clone();
    spawn(async move {
        let _busy = BusyGuard(task_state.status.clone());
        let result = ingest::index_all(
            task_state.ledger.as_ref(),
            task_state.store.as_ref(),
            task_state.llm.as_ref(),
            &task_state.config.index,
            task_state.status.clone(),
        )
        .await;

        let mut status = task_state.status();
        status.is_busy = false;
        match result {
            Ok(summary) => {
                status.message = format!("Indexação concluída! {summary}");
            }
            Err(err) => {
                status.progress = 0.0;
                status.message = format!("Erro na indexação: {err}");
                error!("Error de indexación: {}", err);
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "message": "Indexação iniciada." })),
    ))
}

/// Libera `is_busy` al terminar la tarea de indexación, también si entra
/// en pánico.
struct BusyGuard(Arc<Mutex<Status>>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut status = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if status.is_busy {
            status.is_busy = false;
            status.progress = 0.0;
            status.message = "Indexação interrompida.".to_string();
            error!("La tarea de indexación terminó sin liberar el estado");
        }
    }
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status().clone())
}

#[axum::debug_handler]
async fn source_handler(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let details = state.rag.source_details(&kind, &id).await?;
    Ok(Json(json!({ "success": true, "details": details })))
}

#[axum::debug_handler]
async fn invoice_extract_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if body.is_empty() {
        return Err(bad_request("Nenhum arquivo enviado."));
    }
    if !body.starts_with(b"%PDF") {
        return Err(bad_request("Apenas arquivos PDF são permitidos."));
    }
    info!("PDF recibido ({} bytes)", body.len());

    let extracted = state.invoices.extract(body.to_vec()).await?;
    let validation = check_required_fields(&extracted.invoice);
    Ok(Json(json!({
        "success": true,
        "data": extracted,
        "validation": validation,
    })))
}

#[axum::debug_handler]
async fn invoice_analyze_handler(
    State(state): State<AppState>,
    Payload(payload): Payload<AnalyzePayload>,
) -> Result<Json<Value>, ApiError> {
    let analysis = state.reconciler.analyze(&payload.invoice).await?;
    Ok(Json(json!({ "success": true, "analysis": analysis })))
}

#[axum::debug_handler]
async fn invoice_movement_handler(
    State(state): State<AppState>,
    Payload(payload): Payload<MovementPayload>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .reconciler
        .create_movement(&payload.invoice, &payload.analysis)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "REGISTRO FOI LANÇADO COM SUCESSO!",
        "result": result,
    })))
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

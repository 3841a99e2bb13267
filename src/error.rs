//! Taxonomía de errores del servicio y su traducción a respuestas HTTP.

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum AppError {
    /// El detalle se registra en el log; al cliente sólo llega el mensaje genérico.
    #[error("Falha ao consultar o banco de dados.")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Erro na extração: {0}")]
    Extraction(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Respuesta de error de la API: `{ success: false, error }`.
pub type ApiError = (StatusCode, Json<Value>);

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Llm(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match &err {
            AppError::Database(inner) => error!("Error de base de datos: {inner}"),
            AppError::Llm(inner) => error!("Error del proveedor LLM: {inner}"),
            other => error!("Error atendiendo la petición: {other}"),
        }
        (
            err.status_code(),
            Json(json!({ "success": false, "error": err.to_string() })),
        )
    }
}

/// Atajo para errores de validación de la petición.
pub fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message.into() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_are_redacted() {
        let err = AppError::from(sqlx::Error::Protocol("senha incorreta para postgres".into()));
        let (status, Json(body)) = ApiError::from(err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = body["error"].as_str().unwrap();
        assert!(!message.contains("senha"));
        assert_eq!(body["success"], json!(false));
    }

    #[test]
    fn retryable_llm_errors_map_to_unavailable() {
        let err = AppError::from(LlmError::classify("503 Service Unavailable: model overloaded"));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM
//! (Gemini y OpenAI): completado, embeddings y reintentos con backoff.

use std::future::Future;

use async_trait::async_trait;
use rig::client::{CompletionClient, EmbeddingsClient};
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel;
use rig::providers::{gemini, openai};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AppConfig, LlmProvider, RetryPolicy};

/// Fragmentos que delatan un fallo transitorio del proveedor.
const RETRYABLE_MARKERS: &[&str] = &[
    "503",
    "429",
    "overloaded",
    "quota",
    "resource exhausted",
    "resource_exhausted",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    /// Sobrecarga o cuota agotada; tiene sentido reintentar.
    #[error("O serviço de IA está temporariamente indisponível: {0}")]
    Retryable(String),

    #[error("Falha no serviço de IA: {0}")]
    Fatal(String),

    #[error("O modelo não retornou conteúdo.")]
    Empty,
}

impl LlmError {
    /// Clasifica el mensaje de error del proveedor.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::Retryable(message)
        } else {
            LlmError::Fatal(message)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Retryable(_))
    }
}

/// Parámetros de muestreo según el uso de la llamada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Respuesta corta al usuario.
    Answer,
    /// Generación determinista de SQL.
    Sql,
    /// Extracción de notas fiscales a JSON.
    Extraction,
}

impl Profile {
    /// (temperatura, máximo de tokens de salida).
    pub fn params(&self) -> (f64, u64) {
        match self {
            Profile::Answer => (0.3, 160),
            Profile::Sql => (0.0, 512),
            Profile::Extraction => (0.1, 4096),
        }
    }
}

/// Lo que el resto del servicio necesita de un LLM.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        preamble: &str,
        prompt: &str,
        profile: Profile,
    ) -> Result<String, LlmError>;

    async fn embed(&self, text: &str) -> Result<Vec<f64>, LlmError>;
}

enum Backend {
    Gemini(gemini::Client),
    OpenAI(openai::Client),
}

/// Gestor de LLMs y embeddings. Se construye una vez al arrancar.
pub struct LlmManager {
    backend: Backend,
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let backend = match cfg.llm_provider {
            LlmProvider::Gemini => Backend::Gemini(gemini::Client::new(&cfg.llm_api_key)),
            LlmProvider::OpenAI => Backend::OpenAI(openai::Client::new(&cfg.llm_api_key)),
        };
        Self {
            backend,
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for LlmManager {
    async fn complete(
        &self,
        preamble: &str,
        prompt: &str,
        profile: Profile,
    ) -> Result<String, LlmError> {
        let (temperature, max_tokens) = profile.params();
        debug!("Llamada LLM {:?} con {} caracteres de prompt", profile, prompt.len());

        let response = match &self.backend {
            Backend::Gemini(client) => {
                client
                    .agent(&self.chat_model)
                    .preamble(preamble)
                    .temperature(temperature)
                    .max_tokens(max_tokens)
                    .build()
                    .prompt(prompt)
                    .await
            }
            Backend::OpenAI(client) => {
                client
                    .agent(&self.chat_model)
                    .preamble(preamble)
                    .temperature(temperature)
                    .max_tokens(max_tokens)
                    .build()
                    .prompt(prompt)
                    .await
            }
        }
        .map_err(|e| LlmError::classify(e.to_string()))?;

        let response = response.trim().to_string();
        if response.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(response)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>, LlmError> {
        let embedding = match &self.backend {
            Backend::Gemini(client) => {
                client
                    .embedding_model(&self.embedding_model)
                    .embed_text(text)
                    .await
            }
            Backend::OpenAI(client) => {
                client
                    .embedding_model(&self.embedding_model)
                    .embed_text(text)
                    .await
            }
        }
        .map_err(|e| LlmError::classify(e.to_string()))?;

        if embedding.vec.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(embedding.vec)
    }
}

/// Ejecuta `op` reintentando los errores transitorios con backoff
/// exponencial (`base`, `2·base`, `4·base`…) hasta `max_retries` veces.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                attempt += 1;
                warn!(
                    "{label}: fallo transitorio ({err}); reintento {attempt}/{} en {:?}",
                    policy.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Quita las vallas ```json … ``` que a veces envuelven la salida del modelo.
pub fn strip_code_fence(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn classifies_provider_messages() {
        assert!(LlmError::classify("HTTP 429 Too Many Requests").is_retryable());
        assert!(LlmError::classify("Resource exhausted").is_retryable());
        assert!(LlmError::classify("The model is overloaded").is_retryable());
        assert!(!LlmError::classify("400 invalid api key").is_retryable());
    }

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = with_retry(&RetryPolicy::default(), "prueba", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(LlmError::classify("503 overloaded"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), "prueba", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::classify("quota exceeded")) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Retryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), "prueba", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Fatal("invalid key".into())) }
        })
        .await;

        assert_eq!(result, Err(LlmError::Fatal("invalid key".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Carga y gestión de configuración de la aplicación (Postgres + LLM + NLQ).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Valores de ejemplo que aparecen en los `.env` de plantilla y que nunca
/// son una clave válida.
const PLACEHOLDER_KEYS: &[&str] = &["your_gemini_api_key_here", "coloque_sua_chave_aqui", ""];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Política de reintentos para las llamadas al LLM.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Espera antes del reintento `attempt` (0-based): base, 2·base, 4·base…
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Parámetros ajustables del intérprete NLQ.
#[derive(Clone, Debug)]
pub struct NlqSettings {
    pub similarity_threshold: f64,
    pub text_to_sql: bool,
    pub schema_top_k: usize,
    pub sql_row_limit: usize,
}

impl Default for NlqSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.3,
            text_to_sql: true,
            schema_top_k: 6,
            sql_row_limit: 50,
        }
    }
}

/// Parámetros de la indexación de embeddings.
#[derive(Clone, Debug)]
pub struct IndexSettings {
    pub concurrency: usize,
    pub rate_per_sec: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_per_sec: 5,
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub server_addr: String,
    pub frontend_url: String,
    pub static_dir: String,

    pub llm_provider: LlmProvider,
    pub llm_api_key: String,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    pub retry: RetryPolicy,
    pub nlq: NlqSettings,
    pub index: IndexSettings,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let database_url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => database_url_from_parts(),
        };
        let db_max_connections = parse_or("DB_MAX_CONNECTIONS", 10)?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3003".to_string());
        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:5174".to_string());
        let static_dir = env::var("STATIC_DIR").unwrap_or_else(|_| "frontend/dist".to_string());

        let llm_provider: LlmProvider = env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "gemini".to_string())
            .parse()?;

        let llm_api_key = match llm_provider {
            LlmProvider::Gemini => env::var("GEMINI_API_KEY")
                .or_else(|_| env::var("GOOGLE_GEMINI_API_KEY"))
                .map_err(|_| anyhow!("Falta GEMINI_API_KEY en el entorno"))?,
            LlmProvider::OpenAI => env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow!("Falta OPENAI_API_KEY en el entorno"))?,
        };
        if PLACEHOLDER_KEYS.contains(&llm_api_key.trim()) {
            return Err(anyhow!("La clave del proveedor LLM no está configurada"));
        }

        let (default_chat, default_embedding) = match llm_provider {
            LlmProvider::Gemini => ("gemini-2.0-flash", "text-embedding-004"),
            LlmProvider::OpenAI => ("gpt-4o-mini", "text-embedding-3-small"),
        };
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| default_chat.to_string());
        let llm_embedding_model =
            env::var("LLM_EMBEDDING_MODEL").unwrap_or_else(|_| default_embedding.to_string());

        let retry = RetryPolicy {
            max_retries: parse_or("LLM_MAX_RETRIES", 3)?,
            base_delay: Duration::from_millis(parse_or("LLM_RETRY_BASE_MS", 1000)?),
        };

        let nlq = NlqSettings {
            similarity_threshold: parse_or("NLQ_SIMILARITY_THRESHOLD", 0.3)?,
            text_to_sql: parse_or("NLQ_TEXT_TO_SQL", true)?,
            schema_top_k: parse_or("NLQ_SCHEMA_TOP_K", 6)?,
            sql_row_limit: parse_or("NLQ_SQL_ROW_LIMIT", 50)?,
        };

        let index = IndexSettings {
            concurrency: parse_or::<usize>("INDEX_CONCURRENCY", 4)?.max(1),
            rate_per_sec: parse_or::<u32>("INDEX_RATE_PER_SEC", 5)?.max(1),
        };

        Ok(Self {
            database_url,
            db_max_connections,
            server_addr,
            frontend_url,
            static_dir,
            llm_provider,
            llm_api_key,
            llm_embedding_model,
            llm_chat_model,
            retry,
            nlq,
            index,
        })
    }
}

fn database_url_from_parts() -> String {
    let host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let name = env::var("DB_NAME").unwrap_or_else(|_| "Agroer".to_string());
    let user = env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("DB_PASSWORD").unwrap_or_else(|_| "admin".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{name}")
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Valor inválido para {key}: {raw}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn provider_names_are_case_insensitive() {
        assert_eq!("Gemini".parse::<LlmProvider>().unwrap(), LlmProvider::Gemini);
        assert_eq!("OPENAI".parse::<LlmProvider>().unwrap(), LlmProvider::OpenAI);
        assert!("ollama".parse::<LlmProvider>().is_err());
    }
}

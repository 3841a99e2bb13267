// Módulos de la aplicación
mod answer;
mod api;
mod app_state;
mod config;
mod db;
mod detect;
mod error;
mod format;
mod ingest;
mod invoice;
mod ledger;
mod llm;
mod models;
mod rag;
mod reconcile;
mod resolver;
mod text_to_sql;
mod vector_store;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use axum::{http::HeaderValue, Router};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    app_state::AppState, ledger::PgLedger, llm::LlmManager, vector_store::PgEmbeddingStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Conectar a Postgres y asegurar la tabla de embeddings
    let pool = db::connect_from_config(&cfg)
        .await
        .context("Error conectando a Postgres")?;
    db::ensure_schema(&pool)
        .await
        .context("Error asegurando el esquema de rag_embeddings")?;

    // 4. Inicializar gestor de LLMs y repositorios
    let llm = LlmManager::from_config(&cfg);
    info!(
        "LLM {:?}: chat={} embeddings={}",
        llm.provider, llm.chat_model, llm.embedding_model
    );
    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let store = Arc::new(PgEmbeddingStore::new(pool.clone()));

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState::new(
        cfg.clone(),
        Some(pool),
        ledger.clone(),
        ledger,
        store,
        Arc::new(llm),
        Some(shutdown_tx),
    );

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let cors = match cfg.frontend_url.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new().allow_origin(origin),
        Err(_) => {
            warn!("FRONTEND_URL inválida ({}); se permite cualquier origen.", cfg.frontend_url);
            CorsLayer::new().allow_origin(Any)
        }
    }
    .allow_methods(Any)
    .allow_headers(Any);

    let app = Router::new()
        .merge(api::create_router(app_state))
        .fallback_service(ServeDir::new(&cfg.static_dir))
        .layer(cors);

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}

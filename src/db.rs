use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;
use url::Url;

use crate::config::AppConfig;

/// URL de conexión sin contraseña, para los logs.
pub fn redacted_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<DATABASE_URL inválida>".to_string(),
    }
}

pub async fn connect_from_config(cfg: &AppConfig) -> Result<PgPool> {
    info!("Conectando a Postgres en {}...", redacted_url(&cfg.database_url));
    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&cfg.database_url)
        .await?;
    info!("Conexión a Postgres OK");
    Ok(pool)
}

/// Instalaciones antiguas guardaban ref_id como INTEGER; sólo esas se migran.
fn ref_id_needs_migration(data_type: Option<&str>) -> bool {
    data_type.is_some_and(|t| !t.eq_ignore_ascii_case("text"))
}

/// Crea la tabla de embeddings si no existe. Las tablas de negocio las
/// gestiona la aplicación principal y no se tocan aquí.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rag_embeddings (
           id SERIAL PRIMARY KEY,
           ref_type TEXT NOT NULL,
           ref_id TEXT,
           text TEXT NOT NULL,
           embedding JSONB NOT NULL,
           metadata JSONB,
           created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
           UNIQUE (ref_type, ref_id)
         )",
    )
    .execute(pool)
    .await?;

    let ref_id_type: Option<String> = sqlx::query_scalar(
        "SELECT data_type::text FROM information_schema.columns
          WHERE table_schema = current_schema()
            AND table_name = 'rag_embeddings'
            AND column_name = 'ref_id'",
    )
    .fetch_optional(pool)
    .await?;
    if ref_id_needs_migration(ref_id_type.as_deref()) {
        info!("Migrando rag_embeddings.ref_id a TEXT");
        sqlx::query("ALTER TABLE rag_embeddings ALTER COLUMN ref_id TYPE TEXT USING ref_id::text")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS rag_embeddings_ref_type_idx ON rag_embeddings (ref_type)",
    )
    .execute(pool)
    .await?;

    info!("Esquema de rag_embeddings asegurado.");
    Ok(())
}

/// `true` si la base responde a un `SELECT 1`.
pub async fn ping(pool: &PgPool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}

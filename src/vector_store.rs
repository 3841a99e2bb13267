//! Índice de embeddings en la tabla `rag_embeddings` de Postgres.
//!
//! API pública:
//!   - `EmbeddingStore` (upsert / load / count) y `PgEmbeddingStore`.
//!   - `cosine_similarity`, `rank` y `search` (búsqueda lineal).

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{types::Json, FromRow, PgPool};
use tracing::warn;

use crate::error::Result;
use crate::llm::LanguageModel;
use crate::models::RefType;

/// Embedding listo para guardarse.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEmbedding {
    pub ref_type: RefType,
    pub ref_id: String,
    pub text: String,
    pub embedding: Vec<f64>,
    pub metadata: Value,
}

/// Fila de `rag_embeddings`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub id: i32,
    pub ref_type: RefType,
    pub ref_id: Option<String>,
    pub text: String,
    pub embedding: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub metadata: Value,
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Inserta o reemplaza el embedding de `(ref_type, ref_id)`.
    async fn upsert(&self, item: &NewEmbedding) -> Result<()>;

    /// Todos los embeddings de los tipos pedidos.
    async fn load(&self, types: &[RefType]) -> Result<Vec<StoredEmbedding>>;

    async fn count(&self, ref_type: RefType) -> Result<i64>;
}

/// Similitud coseno; 0 si los vectores están vacíos o tienen distinta longitud.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    dot / (na.sqrt() * nb.sqrt() + 1e-9)
}

/// Ordena por similitud descendente y se queda con los `top_k` primeros.
pub fn rank(query: &[f64], rows: Vec<StoredEmbedding>, top_k: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = rows
        .into_iter()
        .map(|row| SearchHit {
            id: row.id.to_string(),
            score: cosine_similarity(query, &row.embedding),
            metadata: json!({
                "ref_type": row.ref_type.as_str(),
                "ref_id": row.ref_id,
            }),
            text: row.text,
        })
        .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits.truncate(top_k);
    hits
}

/// Embebe `query` y busca los `top_k` fragmentos más parecidos entre `types`.
pub async fn search(
    store: &dyn EmbeddingStore,
    llm: &dyn LanguageModel,
    query: &str,
    top_k: usize,
    types: &[RefType],
) -> Result<Vec<SearchHit>> {
    let query_vec = llm.embed(query).await?;
    let rows = store.load(types).await?;
    Ok(rank(&query_vec, rows, top_k))
}

/// Acepta tanto `[0.1, …]` como `{ "values": [0.1, …] }`.
fn vector_from_json(value: Value) -> Vec<f64> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("values") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items.iter().filter_map(Value::as_f64).collect()
}

#[derive(FromRow)]
struct EmbeddingRow {
    id: i32,
    ref_type: String,
    ref_id: Option<String>,
    text: String,
    embedding: Json<Value>,
}

#[derive(Clone)]
pub struct PgEmbeddingStore {
    pool: PgPool,
}

impl PgEmbeddingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingStore for PgEmbeddingStore {
    async fn upsert(&self, item: &NewEmbedding) -> Result<()> {
        sqlx::query(
            "INSERT INTO rag_embeddings (ref_type, ref_id, text, embedding, metadata)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (ref_type, ref_id)
             DO UPDATE SET text = EXCLUDED.text, embedding = EXCLUDED.embedding,
                           metadata = EXCLUDED.metadata",
        )
        .bind(item.ref_type.as_str())
        .bind(&item.ref_id)
        .bind(&item.text)
        .bind(Json(&item.embedding))
        .bind(Json(&item.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, types: &[RefType]) -> Result<Vec<StoredEmbedding>> {
        let codes: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, EmbeddingRow>(
            "SELECT id, ref_type, ref_id, text, embedding FROM rag_embeddings
             WHERE ref_type = ANY($1)",
        )
        .bind(codes)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let Some(ref_type) = RefType::parse(&row.ref_type) else {
                    warn!("Embedding {} con ref_type desconocido: {}", row.id, row.ref_type);
                    return None;
                };
                Some(StoredEmbedding {
                    id: row.id,
                    ref_type,
                    ref_id: row.ref_id,
                    text: row.text,
                    embedding: vector_from_json(row.embedding.0),
                })
            })
            .collect())
    }

    async fn count(&self, ref_type: RefType) -> Result<i64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM rag_embeddings WHERE ref_type = $1")
                .bind(ref_type.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(total)
    }
}

//! Reindexación de embeddings: pessoas, movimentos, classificações y un
//! chunk de esquema por tabla, con concurrencia acotada y límite de ritmo.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    app_state::Status,
    config::IndexSettings,
    error::Result,
    ledger::Ledger,
    llm::LanguageModel,
    models::{Classification, LedgerEntry, Person, RefType},
    vector_store::{EmbeddingStore, NewEmbedding},
};

const MAX_PERSONS: i64 = 500;
const MAX_ENTRIES: i64 = 1000;
const MAX_CLASSIFICATIONS: i64 = 500;

/// Resumen de una reindexación.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub persons: usize,
    pub entries: usize,
    pub classifications: usize,
    pub schemas: usize,
    pub failed: usize,
}

impl IndexSummary {
    fn record(&mut self, ref_type: RefType) {
        match ref_type {
            RefType::Person => self.persons += 1,
            RefType::LedgerEntry => self.entries += 1,
            RefType::Classification => self.classifications += 1,
            RefType::Schema => self.schemas += 1,
        }
    }
}

impl std::fmt::Display for IndexSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pessoas, {} movimentos, {} classificações e {} tabelas indexadas; {} falhas.",
            self.persons, self.entries, self.classifications, self.schemas, self.failed
        )
    }
}

/// Cubo de fichas: `rate` fichas por segundo con ráfaga de `rate`.
pub struct RateLimiter {
    state: tokio::sync::Mutex<RateState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Self {
        let capacity = rate.max(1) as f64;
        Self {
            state: tokio::sync::Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: capacity,
        }
    }

    /// Espera hasta disponer de una ficha.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.last_refill = now;
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Texto a embeber y su referencia.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub ref_type: RefType,
    pub ref_id: String,
    pub text: String,
    pub metadata: Value,
}

pub fn person_text(person: &Person) -> String {
    format!(
        "Pessoa {} ({}) relacionamento={}",
        person.name,
        person.document.as_deref().unwrap_or(""),
        person.relationship.map(|r| r.as_db()).unwrap_or("")
    )
}

pub fn entry_text(entry: &LedgerEntry) -> String {
    format!(
        "Movimento {} tipo={} valor={:.2} descricao={}",
        entry.document_number.as_deref().unwrap_or(""),
        entry.movement_type.map(|t| t.as_db()).unwrap_or(""),
        entry.total_value,
        entry.description.as_deref().unwrap_or("")
    )
}

pub fn classification_text(classification: &Classification) -> String {
    format!(
        "Classificacao {} categoria={} subcategoria={}",
        classification.description,
        classification.category.as_deref().unwrap_or(""),
        classification.subcategory.as_deref().unwrap_or("")
    )
}

/// Lee de la base todo lo que se va a indexar.
pub async fn collect_documents(ledger: &dyn Ledger) -> Result<Vec<IndexDocument>> {
    let mut docs = Vec::new();

    for person in ledger.list_persons(MAX_PERSONS).await? {
        docs.push(IndexDocument {
            ref_type: RefType::Person,
            ref_id: person.id.to_string(),
            text: person_text(&person),
            metadata: json!({ "nome": person.name }),
        });
    }
    for entry in ledger.list_entries(MAX_ENTRIES).await? {
        docs.push(IndexDocument {
            ref_type: RefType::LedgerEntry,
            ref_id: entry.id.to_string(),
            text: entry_text(&entry),
            metadata: json!({ "numero_documento": entry.document_number }),
        });
    }
    for classification in ledger.list_classifications(MAX_CLASSIFICATIONS).await? {
        docs.push(IndexDocument {
            ref_type: RefType::Classification,
            ref_id: classification.id.to_string(),
            text: classification_text(&classification),
            metadata: json!({ "descricao": classification.description }),
        });
    }
    for table in ledger.table_schemas().await? {
        docs.push(IndexDocument {
            ref_type: RefType::Schema,
            ref_id: table.name.clone(),
            text: table.describe(),
            metadata: json!({ "table": table.name }),
        });
    }

    Ok(docs)
}

fn publish(status: &Mutex<Status>, message: String, progress: f32) {
    let mut status = status.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    status.message = message;
    status.progress = progress;
}

async fn embed_and_store(
    store: &dyn EmbeddingStore,
    llm: &dyn LanguageModel,
    doc: &IndexDocument,
) -> Result<()> {
    let embedding = llm.embed(&doc.text).await?;
    store
        .upsert(&NewEmbedding {
            ref_type: doc.ref_type,
            ref_id: doc.ref_id.clone(),
            text: doc.text.clone(),
            embedding,
            metadata: doc.metadata.clone(),
        })
        .await
}

/// Reembebe todo el contenido indexable. Los fallos individuales se cuentan
/// y se registran; sólo falla si no se puede leer la base.
pub async fn index_all(
    ledger: &dyn Ledger,
    store: &dyn EmbeddingStore,
    llm: &dyn LanguageModel,
    settings: &IndexSettings,
    status: Arc<Mutex<Status>>,
) -> Result<IndexSummary> {
    let docs = collect_documents(ledger).await?;
    let total = docs.len();
    info!("Indexando {total} documentos (concurrencia {})", settings.concurrency);
    publish(&status, format!("Indexando {total} documentos..."), 0.0);

    let limiter = RateLimiter::per_second(settings.rate_per_sec);
    let mut results = stream::iter(docs)
        .map(|doc| {
            let limiter = &limiter;
            async move {
                limiter.acquire().await;
                let outcome = embed_and_store(store, llm, &doc).await;
                (doc, outcome)
            }
        })
        .buffer_unordered(settings.concurrency.max(1));

    let mut summary = IndexSummary::default();
    let mut processed = 0usize;
    while let Some((doc, outcome)) = results.next().await {
        processed += 1;
        match outcome {
            Ok(()) => summary.record(doc.ref_type),
            Err(err) => {
                summary.failed += 1;
                warn!("No se pudo indexar {} {}: {err}", doc.ref_type.as_str(), doc.ref_id);
            }
        }
        publish(
            &status,
            format!("[{processed}/{total}] {} {}", doc.ref_type.as_str(), doc.ref_id),
            processed as f32 / total as f32,
        );
    }

    info!("Indexación terminada: {summary}");
    Ok(summary)
}

use std::sync::{Arc, Mutex, MutexGuard};

use sqlx::PgPool;
use tokio::sync::oneshot;

use crate::{
    config::AppConfig,
    invoice::InvoiceExtractor,
    ledger::{Ledger, LedgerWriter},
    llm::LanguageModel,
    rag::RagService,
    reconcile::Reconciler,
    vector_store::EmbeddingStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// `None` en las pruebas del router, que no tienen base real.
    pub pool: Option<PgPool>,
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn EmbeddingStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub rag: Arc<RagService>,
    pub invoices: Arc<InvoiceExtractor>,
    pub reconciler: Arc<Reconciler>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Estado de la indexación en segundo plano.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}

impl AppState {
    /// Construye los servicios sobre los colaboradores ya creados.
    pub fn new(
        config: AppConfig,
        pool: Option<PgPool>,
        ledger: Arc<dyn Ledger>,
        writer: Arc<dyn LedgerWriter>,
        store: Arc<dyn EmbeddingStore>,
        llm: Arc<dyn LanguageModel>,
        shutdown_sender: Option<oneshot::Sender<()>>,
    ) -> Self {
        let rag = RagService::new(ledger.clone(), store.clone(), llm.clone(), &config.nlq);
        let invoices = InvoiceExtractor::new(llm.clone(), config.retry.clone());
        Self {
            rag: Arc::new(rag),
            invoices: Arc::new(invoices),
            reconciler: Arc::new(Reconciler::new(writer)),
            status: Arc::new(Mutex::new(Status {
                is_busy: false,
                message: "Servidor pronto.".to_string(),
                progress: 0.0,
            })),
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
            config,
            pool,
            ledger,
            store,
            llm,
        }
    }

    /// Estado de la indexación; un mutex envenenado no bloquea la API.
    pub fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

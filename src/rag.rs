//! Cadena de estrategias de `/rag/simple`, búsqueda por embeddings y detalle
//! de las fuentes citadas.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    answer::AnswerBuilder,
    config::NlqSettings,
    detect::{detect_entity, detect_movement_type, EntityRole},
    error::{AppError, Result},
    ledger::{like_pattern, CounterpartyFilter, EntryOrder, Ledger, LedgerFilter},
    llm::{LanguageModel, Profile},
    models::{
        Classification, EntryClassification, Installment, LedgerEntry, Person, RagAnswer,
        RefType, Source,
    },
    text_to_sql::{SqlGenerator, SqlOutcome},
    vector_store::{self, EmbeddingStore, SearchHit},
};

const CONTEXT_LINES: usize = 12;
const FOCUS_ENTRIES: i64 = 6;
const SEARCH_LIMIT: i64 = 20;
const PRIORITY_ENTRIES: usize = 3;
const EXTRA_SOURCES: usize = 8;
const EMBEDDING_TOP_K: usize = 8;
const DETAIL_ROWS: i64 = 50;

const ANSWER_PREAMBLE: &str = "Você é um assistente especializado em consultas financeiras agrícolas.
Responda em português de forma clara e direta, com NO MÁXIMO 2 frases.
Cite IDs quando útil. Use somente o contexto abaixo, não invente dados.
Se a pergunta for curta ou ambígua, peça esclarecimento em 1 frase e dê até 2 exemplos concisos.";

/// Línea de contexto para el LLM.
#[derive(Debug, Clone, PartialEq)]
struct ContextItem {
    kind: RefType,
    id: i32,
    title: Option<String>,
    text: Option<String>,
}

impl ContextItem {
    fn person(p: &Person) -> Self {
        Self {
            kind: RefType::Person,
            id: p.id,
            title: Some(p.name.clone()),
            text: p.address.clone().or_else(|| p.document.clone()),
        }
    }

    fn entry(e: &LedgerEntry) -> Self {
        Self {
            kind: RefType::LedgerEntry,
            id: e.id,
            title: e.document_number.clone(),
            text: e.description.clone(),
        }
    }

    fn classification(c: &Classification) -> Self {
        Self {
            kind: RefType::Classification,
            id: c.id,
            title: Some(c.description.clone()),
            text: c.category.clone(),
        }
    }

    fn line(&self, position: usize) -> String {
        format!(
            "[#{position}] Origem={} | id={} | titulo={} | texto={}",
            self.kind.as_str(),
            self.id,
            self.title.as_deref().unwrap_or(""),
            self.text.as_deref().unwrap_or("")
        )
    }

    fn same_as(&self, other: &ContextItem) -> bool {
        self.kind == other.kind && self.id == other.id
    }

    fn source(&self) -> Source {
        Source {
            id: self.id.to_string(),
            title: self.title.clone(),
            kind: self.kind,
            score: None,
        }
    }
}

/// Persona foco primero, luego 3 movimientos y hasta 8 extras sin repetir.
fn prioritize_sources(focus: Option<&Person>, items: &[ContextItem]) -> Vec<Source> {
    let mut prioritized: Vec<ContextItem> = focus.map(ContextItem::person).into_iter().collect();
    prioritized.extend(
        items
            .iter()
            .filter(|i| i.kind == RefType::LedgerEntry)
            .take(PRIORITY_ENTRIES)
            .cloned(),
    );
    let extras: Vec<ContextItem> = items
        .iter()
        .filter(|i| !prioritized.iter().any(|p| p.same_as(i)))
        .take(EXTRA_SOURCES)
        .cloned()
        .collect();
    prioritized.iter().chain(&extras).map(ContextItem::source).collect()
}

#[derive(Debug, Serialize)]
pub struct PersonDetails {
    #[serde(flatten)]
    pub person: Person,
    pub qtd_notas: i64,
    pub total_notas: f64,
    pub notas: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize)]
pub struct EntryDetails {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    pub fornecedor: Option<Person>,
    pub faturado: Option<Person>,
    pub parcelas: Vec<Installment>,
    pub classificacoes: Vec<EntryClassification>,
    pub qtd_parcelas: usize,
    pub total_parcelado: f64,
}

#[derive(Debug, Serialize)]
pub struct ClassificationDetails {
    #[serde(flatten)]
    pub classification: Classification,
    pub qtd_movimentos: i64,
    pub total_classificado: f64,
    pub movimentos: Vec<LedgerEntry>,
}

/// Detalle enriquecido de una fuente citada.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SourceDetails {
    Person(PersonDetails),
    Entry(EntryDetails),
    Classification(ClassificationDetails),
}

pub struct RagService {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn EmbeddingStore>,
    llm: Arc<dyn LanguageModel>,
    answers: AnswerBuilder,
    sql: SqlGenerator,
    text_to_sql: bool,
}

impl RagService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn EmbeddingStore>,
        llm: Arc<dyn LanguageModel>,
        settings: &NlqSettings,
    ) -> Self {
        Self {
            answers: AnswerBuilder::new(ledger.clone(), settings.similarity_threshold),
            sql: SqlGenerator::new(
                ledger.clone(),
                store.clone(),
                llm.clone(),
                settings.schema_top_k,
                settings.sql_row_limit,
            ),
            text_to_sql: settings.text_to_sql,
            ledger,
            store,
            llm,
        }
    }

    /// Responde a una pregunta en lenguaje natural; gana la primera
    /// estrategia que devuelve algo.
    pub async fn answer(&self, query: &str) -> Result<RagAnswer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidInput(
                "Parâmetro \"query\" é obrigatório.".into(),
            ));
        }
        let query_id = Uuid::new_v4();
        self.run_chain(query)
            .instrument(info_span!("rag", %query_id))
            .await
    }

    async fn run_chain(&self, query: &str) -> Result<RagAnswer> {
        if let Some(answer) = self.try_text_to_sql(query).await {
            info!(strategy = "text_to_sql", "Pregunta respondida");
            return Ok(answer);
        }
        if let Some(answer) = self.answers.answer_name_overview(query).await? {
            info!(strategy = "name_overview", "Pregunta respondida");
            return Ok(answer);
        }
        if let Some(answer) = self.answers.answer_nlq(query).await? {
            info!(strategy = "nlq", "Pregunta respondida");
            return Ok(answer);
        }
        if let Some(answer) = self.answers.answer_legacy_supplier(query).await? {
            info!(strategy = "legacy_supplier", "Pregunta respondida");
            return Ok(answer);
        }
        let answer = self.answer_with_context(query).await?;
        info!(strategy = "llm_context", "Pregunta respondida");
        Ok(answer)
    }

    /// Cualquier fallo aquí sólo hace que la cadena siga.
    async fn try_text_to_sql(&self, query: &str) -> Option<RagAnswer> {
        if !self.text_to_sql {
            return None;
        }
        match self.sql.has_schema().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("No se pudo comprobar el esquema indexado: {e}");
                return None;
            }
        }
        match self.sql.generate_and_run(query).await {
            Ok(SqlOutcome::Answered(found)) => Some(RagAnswer::new(found.answer, found.sources)),
            Ok(SqlOutcome::Empty) => None,
            Ok(SqlOutcome::Rejected(reason)) => {
                info!("Text-to-SQL descartado: {reason}");
                None
            }
            Err(e) => {
                warn!("Text-to-SQL falló: {e}");
                None
            }
        }
    }

    async fn focus_person(&self, query: &str) -> Result<Option<(EntityRole, Person)>> {
        let entity = detect_entity(query);
        let (Some(role), Some(name)) = (entity.role, entity.name) else {
            return Ok(None);
        };
        if name.chars().count() < 2 {
            return Ok(None);
        }
        let found = self.answers.resolver().resolve(role, &name).await?;
        Ok(found.map(|p| (role, p)))
    }

    async fn gather_context(
        &self,
        query: &str,
        focus: Option<&(EntityRole, Person)>,
    ) -> Result<Vec<ContextItem>> {
        let mut items = Vec::new();

        if let Some((role, person)) = focus {
            items.push(ContextItem::person(person));
            let counterparty = match role {
                EntityRole::Supplier => CounterpartyFilter::Supplier(person.id),
                EntityRole::Client | EntityRole::Payee => CounterpartyFilter::Payee(person.id),
            };
            let filter = LedgerFilter {
                counterparty: Some(counterparty),
                movement_type: detect_movement_type(query),
                ..Default::default()
            };
            let recent = self
                .ledger
                .entries(&filter, EntryOrder::MostRecent, FOCUS_ENTRIES)
                .await?;
            items.extend(recent.iter().map(ContextItem::entry));
        }

        let pattern = like_pattern(query);
        let persons = self
            .ledger
            .search_persons(&[], std::slice::from_ref(&pattern), SEARCH_LIMIT)
            .await?;
        items.extend(persons.iter().map(ContextItem::person));
        let entries = self.ledger.search_entries(&pattern, SEARCH_LIMIT).await?;
        items.extend(entries.iter().map(ContextItem::entry));
        let classifications = self
            .ledger
            .search_classifications(&pattern, SEARCH_LIMIT)
            .await?;
        items.extend(classifications.iter().map(ContextItem::classification));

        Ok(items)
    }

    /// Último recurso: el LLM redacta con el contexto encontrado por ILIKE.
    async fn answer_with_context(&self, query: &str) -> Result<RagAnswer> {
        let focus = self.focus_person(query).await?;
        let items = self.gather_context(query, focus.as_ref()).await?;

        let context = items
            .iter()
            .take(CONTEXT_LINES)
            .enumerate()
            .map(|(i, item)| item.line(i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let focus_line = focus
            .as_ref()
            .map(|(_, p)| format!("Fornecedor/Cliente foco: {} (id={})\n", p.name, p.id))
            .unwrap_or_default();
        let prompt = format!("Pergunta: {query}\n{focus_line}\nContexto:\n{context}");

        let text = self
            .llm
            .complete(ANSWER_PREAMBLE, &prompt, Profile::Answer)
            .await?;
        let sources = prioritize_sources(focus.as_ref().map(|(_, p)| p), &items);
        Ok(RagAnswer::new(text.trim(), sources))
    }

    /// Los 8 fragmentos más parecidos entre pessoas, movimentos y clasificaciones.
    pub async fn search_embeddings(&self, query: &str) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidInput(
                "Parâmetro \"query\" é obrigatório.".into(),
            ));
        }
        vector_store::search(
            self.store.as_ref(),
            self.llm.as_ref(),
            query,
            EMBEDDING_TOP_K,
            &[RefType::Person, RefType::LedgerEntry, RefType::Classification],
        )
        .await
    }

    pub async fn source_details(&self, kind: &str, id: &str) -> Result<SourceDetails> {
        let kind = match RefType::parse(kind) {
            Some(RefType::Schema) | None => {
                return Err(AppError::InvalidInput(format!(
                    "Tipo de fonte não suportado: {kind}"
                )))
            }
            Some(kind) => kind,
        };
        let id: i32 = id
            .trim()
            .parse()
            .map_err(|_| AppError::InvalidInput("Parâmetros de fonte inválidos.".into()))?;
        let not_found = || AppError::NotFound("Fonte não encontrada.".into());

        match kind {
            RefType::Person => {
                let person = self.ledger.person(id).await?.ok_or_else(not_found)?;
                let filter = LedgerFilter {
                    counterparty: Some(CounterpartyFilter::Either(id)),
                    ..Default::default()
                };
                let totals = self.ledger.totals(&filter).await?;
                let notas = self
                    .ledger
                    .entries(&filter, EntryOrder::MostRecent, DETAIL_ROWS)
                    .await?;
                Ok(SourceDetails::Person(PersonDetails {
                    person,
                    qtd_notas: totals.count,
                    total_notas: totals.sum,
                    notas,
                }))
            }
            RefType::LedgerEntry => {
                let entry = self.ledger.entry(id).await?.ok_or_else(not_found)?;
                let fornecedor = match entry.supplier_id {
                    Some(pid) => self.ledger.person(pid).await?,
                    None => None,
                };
                let faturado = match entry.payee_id {
                    Some(pid) => self.ledger.person(pid).await?,
                    None => None,
                };
                let mut parcelas = self.ledger.installments(id).await?;
                parcelas.sort_by_key(|p| p.number);
                let classificacoes = self.ledger.entry_classifications(id).await?;
                Ok(SourceDetails::Entry(EntryDetails {
                    qtd_parcelas: parcelas.len(),
                    total_parcelado: parcelas.iter().map(|p| p.value).sum(),
                    entry,
                    fornecedor,
                    faturado,
                    parcelas,
                    classificacoes,
                }))
            }
            _ => {
                let classification = self.ledger.classification(id).await?.ok_or_else(not_found)?;
                let (qtd_movimentos, total_classificado) =
                    self.ledger.classification_usage(id).await?;
                let movimentos = self.ledger.classification_entries(id, DETAIL_ROWS).await?;
                Ok(SourceDetails::Classification(ClassificationDetails {
                    classification,
                    qtd_movimentos,
                    total_classificado,
                    movimentos,
                }))
            }
        }
    }
}

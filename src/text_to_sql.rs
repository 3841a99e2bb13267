//! Generación de SQL a partir de la pregunta, guiada por los chunks de
//! esquema más parecidos. La sentencia se valida (sólo SELECT, sólo tablas
//! conocidas), se acota y se ejecuta en una transacción de sólo lectura.
//!
//! El filtro de palabras clave no es una frontera de seguridad: la
//! protección real es la transacción READ ONLY de `Ledger::run_read_only`.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::Result;
use crate::format::format_brl;
use crate::ledger::Ledger;
use crate::llm::{LanguageModel, Profile};
use crate::models::{RefType, Source};
use crate::vector_store::{self, EmbeddingStore};

const SQL_PREAMBLE: &str = r#"Você gera consultas SQL para PostgreSQL.
Responda com exatamente UMA instrução SELECT somente leitura, dentro de um bloco ```sql.
Use apenas as tabelas e colunas do esquema fornecido.
Nunca use INSERT, UPDATE, DELETE, DDL nem várias instruções."#;

/// Fuentes inferidas como máximo a partir de las filas.
const MAX_SOURCES: usize = 4;
/// Filas descritas en la respuesta genérica.
const DESCRIBED_ROWS: usize = 3;

static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:sql|SQL)?\s*(.*?)```").unwrap());
static SQL_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)\bSQL:\s*(.*)").unwrap());
static FORBIDDEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|truncate|grant|revoke|copy|vacuum)\b",
    )
    .unwrap()
});
static TRAILING_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blimit\s+\d+(?:\s+offset\s+\d+)?\s*$").unwrap());
static TABLE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:from|join)\s+("?[a-z_][a-z0-9_]*"?(?:\."?[a-z_][a-z0-9_]*"?)?)"#)
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlAnswer {
    pub answer: String,
    pub sql: String,
    pub rows: Vec<Map<String, Value>>,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlOutcome {
    Answered(SqlAnswer),
    /// La consulta no devolvió filas.
    Empty,
    /// No se generó una consulta utilizable; el motivo va al log.
    Rejected(String),
}

/// SQL de la respuesta del modelo: primer bloque ``` , si no lo que sigue a
/// `SQL:`, si no el texto entero.
pub fn extract_sql(raw: &str) -> String {
    if let Some(caps) = FENCED.captures(raw) {
        return caps[1].trim().to_string();
    }
    if let Some(caps) = SQL_MARKER.captures(raw) {
        return caps[1].trim().to_string();
    }
    raw.trim().to_string()
}

/// `true` si empieza por SELECT y no contiene ninguna palabra de DDL/DML.
/// Se aplica al texto completo, antes de cortar en el primer `;`.
pub fn validate_select_only(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    let starts_with_select = trimmed
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"));
    starts_with_select && !FORBIDDEN.is_match(sql)
}

/// Primera sentencia: hasta el primer `;` fuera de comillas.
fn first_statement(sql: &str) -> &str {
    let mut quote: Option<char> = None;
    for (pos, c) in sql.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(open), _) if c == open => quote = None,
            (None, ';') => return &sql[..pos],
            _ => {}
        }
    }
    sql
}

/// Corta en el primer `;` y añade `LIMIT n` si la consulta externa no
/// termina ya en LIMIT (el de una subconsulta no cuenta).
pub fn sanitize(sql: &str, row_limit: usize) -> String {
    let statement = first_statement(sql).trim();
    if TRAILING_LIMIT.is_match(statement) {
        statement.to_string()
    } else {
        format!("{statement} LIMIT {row_limit}")
    }
}

/// Tablas citadas tras FROM/JOIN, en minúsculas y sin esquema ni comillas.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    TABLE_REF
        .captures_iter(sql)
        .map(|caps| {
            let name = caps[1].replace('"', "").to_lowercase();
            match name.rsplit_once('.') {
                Some((_, table)) => table.to_string(),
                None => name,
            }
        })
        .collect()
}

/// Identificadores presentes en los chunks de esquema (tablas y columnas);
/// `EXTRACT(... FROM columna)` también pasa por el filtro de FROM.
fn known_identifiers(schema: &str) -> HashSet<String> {
    schema
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_count_column(name: &str) -> bool {
    ["count", "qtd", "quantidade", "total_registros", "numero"]
        .iter()
        .any(|k| name.contains(k))
}

fn is_value_column(name: &str) -> bool {
    ["valor", "total", "soma", "media", "sum", "avg"]
        .iter()
        .any(|k| name.contains(k))
}

/// "soma_total" → "Soma total"
fn humanize(column: &str) -> String {
    let spaced = column.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn render_value(column: &str, value: &Value) -> String {
    match value {
        Value::Number(n) if is_value_column(&column.to_lowercase()) => {
            format_brl(n.as_f64().unwrap_or(0.0))
        }
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

/// Redacta la respuesta según la forma de las filas.
pub fn synthesize_answer(rows: &[Map<String, Value>]) -> String {
    let Some(first) = rows.first() else {
        return "Nenhum registro encontrado.".to_string();
    };

    if rows.len() == 1 && first.len() == 1 {
        if let Some((column, value)) = first.iter().next() {
            let lower = column.to_lowercase();
            if let Some(n) = value.as_f64() {
                if is_count_column(&lower) {
                    let count = n.round() as i64;
                    let term = if count == 1 { "registro" } else { "registros" };
                    let verb = if count == 1 { "Foi encontrado" } else { "Foram encontrados" };
                    return format!("{verb} {count} {term}.");
                }
                if is_value_column(&lower) {
                    return format!("{}: {}.", humanize(column), format_brl(n));
                }
            }
        }
    }

    let described = rows
        .iter()
        .take(DESCRIBED_ROWS)
        .map(|row| {
            row.iter()
                .map(|(column, value)| format!("{column}={}", render_value(column, value)))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join("; ");
    let rest = if rows.len() > DESCRIBED_ROWS {
        "; entre outros"
    } else {
        ""
    };
    let term = if rows.len() == 1 { "registro" } else { "registros" };
    format!("Encontrei {} {term}: {described}{rest}.", rows.len())
}

fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn text_of(row: &Map<String, Value>, column: &str) -> Option<String> {
    row.get(column).and_then(Value::as_str).map(str::to_string)
}

/// Fuentes deducidas de las columnas de identificador de cada fila.
pub fn infer_sources(rows: &[Map<String, Value>]) -> Vec<Source> {
    let mut sources: Vec<Source> = Vec::new();
    for row in rows {
        let candidate = if let Some(id) = row.get("movimento_id").and_then(id_of) {
            Some((RefType::LedgerEntry, id, text_of(row, "numero_documento")))
        } else if let (Some(id), true) = (
            row.get("id").and_then(id_of),
            row.contains_key("numero_documento"),
        ) {
            Some((RefType::LedgerEntry, id, text_of(row, "numero_documento")))
        } else if let (Some(id), true) = (row.get("id").and_then(id_of), row.contains_key("nome")) {
            Some((RefType::Person, id, text_of(row, "nome")))
        } else if let Some(id) = ["pessoa_id", "fornecedor_id", "faturado_id"]
            .iter()
            .find_map(|c| row.get(*c).and_then(id_of))
        {
            Some((RefType::Person, id, text_of(row, "nome")))
        } else {
            row.get("classificacao_id")
                .and_then(id_of)
                .map(|id| (RefType::Classification, id, text_of(row, "descricao")))
        };

        if let Some((kind, id, title)) = candidate {
            if !sources.iter().any(|s| s.kind == kind && s.id == id) {
                sources.push(Source {
                    id,
                    title,
                    kind,
                    score: None,
                });
            }
        }
        if sources.len() >= MAX_SOURCES {
            break;
        }
    }
    sources
}

pub struct SqlGenerator {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn EmbeddingStore>,
    llm: Arc<dyn LanguageModel>,
    schema_top_k: usize,
    row_limit: usize,
}

impl SqlGenerator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn EmbeddingStore>,
        llm: Arc<dyn LanguageModel>,
        schema_top_k: usize,
        row_limit: usize,
    ) -> Self {
        Self {
            ledger,
            store,
            llm,
            schema_top_k,
            row_limit,
        }
    }

    /// Hay chunks de esquema indexados.
    pub async fn has_schema(&self) -> Result<bool> {
        Ok(self.store.count(RefType::Schema).await? > 0)
    }

    pub async fn generate_and_run(&self, query: &str) -> Result<SqlOutcome> {
        let hits = vector_store::search(
            self.store.as_ref(),
            self.llm.as_ref(),
            query,
            self.schema_top_k,
            &[RefType::Schema],
        )
        .await?;
        if hits.is_empty() {
            return Ok(SqlOutcome::Rejected("nenhum esquema indexado".into()));
        }

        let schema = hits
            .iter()
            .map(|h| h.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!("Esquema:\n{schema}\n\nPergunta: {query}\n\nSQL:");
        let allowed = known_identifiers(&schema);

        let raw = match self.llm.complete(SQL_PREAMBLE, &prompt, Profile::Sql).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Text-to-SQL: el LLM falló ({e}); se sigue con las heurísticas");
                return Ok(SqlOutcome::Rejected(e.to_string()));
            }
        };

        let sql = extract_sql(&raw);
        if !validate_select_only(&sql) {
            warn!("Text-to-SQL: SQL rechazado por no ser un SELECT puro: {sql}");
            return Ok(SqlOutcome::Rejected("SQL não é um SELECT somente leitura".into()));
        }
        if let Some(unknown) = referenced_tables(&sql)
            .into_iter()
            .find(|t| !allowed.contains(t))
        {
            warn!("Text-to-SQL: tabla fuera del esquema permitido: {unknown}");
            return Ok(SqlOutcome::Rejected(format!("tabela não permitida: {unknown}")));
        }

        let sql = sanitize(&sql, self.row_limit);
        let rows = match self.ledger.run_read_only(&sql).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Text-to-SQL: fallo al ejecutar '{sql}': {e:?}");
                return Ok(SqlOutcome::Rejected("falha ao executar o SQL gerado".into()));
            }
        };
        if rows.is_empty() {
            info!("Text-to-SQL sin filas para: {sql}");
            return Ok(SqlOutcome::Empty);
        }

        Ok(SqlOutcome::Answered(SqlAnswer {
            answer: synthesize_answer(&rows),
            sources: infer_sources(&rows),
            sql,
            rows,
        }))
    }
}

//! Acceso a las tablas de negocio (`Pessoas`, `MovimentoContas`,
//! `Classificacao`, `ParcelasContas`) a través de consultas parametrizadas.
//!
//! API pública:
//!   - `Ledger`: lecturas usadas por el NLQ/RAG.
//!   - `LedgerWriter`: altas usadas por la conciliación de notas.
//!   - `PgLedger`: implementación sobre `sqlx::PgPool`.
//!
//! Todo fragmento SQL dinámico sale de plantillas fijas de este módulo; los
//! valores del usuario viajan siempre como parámetros.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{types::Json, FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::error::Result;
use crate::format::digits_only;
use crate::models::{
    Classification, EntryClassification, Installment, LedgerEntry, MovementType, PaymentStatus,
    Person, Relationship,
};

/// Columna de `MovimentoContas` que apunta a la contraparte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Supplier,
    Payee,
}

impl Side {
    fn column(&self) -> &'static str {
        match self {
            Side::Supplier => "m.fornecedor_id",
            Side::Payee => "m.faturado_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterpartyFilter {
    Supplier(i32),
    Payee(i32),
    Either(i32),
}

/// Filtros combinados con AND; cada uno es opcional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFilter {
    pub counterparty: Option<CounterpartyFilter>,
    pub movement_type: Option<MovementType>,
    pub status: Option<PaymentStatus>,
    pub issued_from: Option<NaiveDate>,
    pub issued_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrder {
    MostRecent,
    HighestValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerTotals {
    pub count: i64,
    pub sum: f64,
    pub average: f64,
    pub last_issue: Option<NaiveDate>,
}

/// Persona que aparece como contraparte junto con su número de movimientos.
#[derive(Debug, Clone, PartialEq)]
pub struct Counterparty {
    pub person: Person,
    pub entries: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Descripción textual que se indexa como chunk de esquema.
    pub fn describe(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "{} {} {}",
                    c.name,
                    c.data_type,
                    if c.nullable { "NULL" } else { "NOT NULL" }
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("Tabela {}: {}", self.name, columns)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInstallment {
    pub number: i32,
    pub due_date: Option<NaiveDate>,
    pub value: f64,
}

/// Movimiento a registrar junto con su clasificación y sus parcelas.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub document_number: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub description: String,
    pub total_value: f64,
    pub movement_type: MovementType,
    pub supplier_id: i32,
    pub payee_id: i32,
    pub classification_id: i32,
    pub installments: Vec<NewInstallment>,
}

/// Clave con la que se detecta un movimiento ya registrado.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateKey {
    pub document_number: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub total_value: f64,
    pub supplier_id: i32,
    pub payee_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEntry {
    pub entry_id: i32,
    pub installment_ids: Vec<i32>,
}

/// Lecturas sobre el libro de movimientos.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Personas cuyo nombre o documento contiene alguno de `patterns`
    /// (patrones ILIKE ya construidos), limitadas a `roles` si no está vacío.
    async fn search_persons(
        &self,
        roles: &[Relationship],
        patterns: &[String],
        limit: i64,
    ) -> Result<Vec<Person>>;

    /// Contrapartes con al menos un movimiento en `side`, de más a menos
    /// frecuentes. Sin patrones devuelve las más frecuentes.
    async fn search_counterparties(
        &self,
        side: Side,
        patterns: &[String],
        limit: i64,
    ) -> Result<Vec<Counterparty>>;

    async fn totals(&self, filter: &LedgerFilter) -> Result<LedgerTotals>;

    async fn entries(
        &self,
        filter: &LedgerFilter,
        order: EntryOrder,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>>;

    /// Movimientos cuyo número o descripción coincide con `pattern`.
    async fn search_entries(&self, pattern: &str, limit: i64) -> Result<Vec<LedgerEntry>>;

    async fn search_classifications(&self, pattern: &str, limit: i64)
        -> Result<Vec<Classification>>;

    async fn person(&self, id: i32) -> Result<Option<Person>>;
    async fn entry(&self, id: i32) -> Result<Option<LedgerEntry>>;
    async fn classification(&self, id: i32) -> Result<Option<Classification>>;

    async fn installments(&self, entry_id: i32) -> Result<Vec<Installment>>;
    async fn entry_classifications(&self, entry_id: i32) -> Result<Vec<EntryClassification>>;

    /// (número de movimientos, valor total clasificado).
    async fn classification_usage(&self, classification_id: i32) -> Result<(i64, f64)>;
    async fn classification_entries(
        &self,
        classification_id: i32,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>>;

    async fn list_persons(&self, limit: i64) -> Result<Vec<Person>>;
    async fn list_entries(&self, limit: i64) -> Result<Vec<LedgerEntry>>;
    async fn list_classifications(&self, limit: i64) -> Result<Vec<Classification>>;

    /// Tablas del esquema público (sin la tabla de embeddings).
    async fn table_schemas(&self) -> Result<Vec<TableSchema>>;

    /// Ejecuta un SELECT ya validado en una transacción de sólo lectura.
    async fn run_read_only(&self, sql: &str) -> Result<Vec<Map<String, Value>>>;
}

/// Altas usadas al conciliar una nota fiscal.
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    async fn find_person_by_document(
        &self,
        role: Relationship,
        document: &str,
    ) -> Result<Option<Person>>;

    async fn find_expense_classification(&self, description: &str)
        -> Result<Option<Classification>>;

    async fn create_person(
        &self,
        role: Relationship,
        name: &str,
        document: &str,
    ) -> Result<Person>;

    async fn create_expense_classification(&self, description: &str) -> Result<Classification>;

    async fn find_duplicate_entry(&self, key: &DuplicateKey) -> Result<Option<LedgerEntry>>;

    /// Movimiento + clasificación + parcelas, todo o nada.
    async fn record_entry(&self, entry: &NewLedgerEntry) -> Result<RecordedEntry>;
}

/// Patrón ILIKE `%fragmento%` con los comodines del usuario escapados.
pub fn like_pattern(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len() + 2);
    escaped.push('%');
    for ch in fragment.trim().chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

const PERSON_COLUMNS: &str = "p.id, p.nome, p.documento, p.tipo_relacionamento, p.ativo, p.endereco";
const PERSON_GROUP_BY: &str =
    "p.id, p.nome, p.documento, p.tipo_relacionamento, p.ativo, p.endereco";
const ENTRY_COLUMNS: &str = "m.id, m.numero_documento, m.data_emissao, m.data_vencimento, \
     m.descricao, m.valor_total::float8 AS valor_total, m.tipo_movimento, m.status_pagamento, \
     m.fornecedor_id, m.faturado_id";
const CLASSIFICATION_COLUMNS: &str = "c.id, c.descricao, c.tipo, c.categoria, c.subcategoria";

#[derive(FromRow)]
struct PersonRow {
    id: i32,
    nome: Option<String>,
    documento: Option<String>,
    tipo_relacionamento: Option<String>,
    ativo: Option<bool>,
    endereco: Option<String>,
}

impl From<PersonRow> for Person {
    fn from(row: PersonRow) -> Self {
        Person {
            id: row.id,
            name: row.nome.unwrap_or_default(),
            document: row.documento,
            relationship: row
                .tipo_relacionamento
                .as_deref()
                .and_then(Relationship::from_db),
            active: row.ativo.unwrap_or(true),
            address: row.endereco,
        }
    }
}

#[derive(FromRow)]
struct CounterpartyRow {
    #[sqlx(flatten)]
    person: PersonRow,
    qtd: i64,
}

#[derive(FromRow)]
struct EntryRow {
    id: i32,
    numero_documento: Option<String>,
    data_emissao: Option<NaiveDate>,
    data_vencimento: Option<NaiveDate>,
    descricao: Option<String>,
    valor_total: Option<f64>,
    tipo_movimento: Option<String>,
    status_pagamento: Option<String>,
    fornecedor_id: Option<i32>,
    faturado_id: Option<i32>,
}

impl From<EntryRow> for LedgerEntry {
    fn from(row: EntryRow) -> Self {
        LedgerEntry {
            id: row.id,
            document_number: row.numero_documento,
            issue_date: row.data_emissao,
            due_date: row.data_vencimento,
            description: row.descricao,
            total_value: row.valor_total.unwrap_or(0.0),
            movement_type: row.tipo_movimento.as_deref().and_then(MovementType::from_db),
            payment_status: row
                .status_pagamento
                .as_deref()
                .and_then(PaymentStatus::from_db),
            supplier_id: row.fornecedor_id,
            payee_id: row.faturado_id,
        }
    }
}

#[derive(FromRow)]
struct ClassificationRow {
    id: i32,
    descricao: Option<String>,
    tipo: Option<String>,
    categoria: Option<String>,
    subcategoria: Option<String>,
}

impl From<ClassificationRow> for Classification {
    fn from(row: ClassificationRow) -> Self {
        Classification {
            id: row.id,
            description: row.descricao.unwrap_or_default(),
            kind: row.tipo,
            category: row.categoria,
            subcategory: row.subcategoria,
        }
    }
}

#[derive(FromRow)]
struct InstallmentRow {
    id: i32,
    numero_parcela: Option<i32>,
    data_vencimento: Option<NaiveDate>,
    valor_parcela: Option<f64>,
    valor_pago: Option<f64>,
    status_parcela: Option<String>,
}

#[derive(FromRow)]
struct EntryClassificationRow {
    classificacao_id: i32,
    descricao: Option<String>,
    valor_classificacao: Option<f64>,
    percentual: Option<f64>,
}

/// Conecta un `WHERE`/`AND` según si ya hay condiciones.
struct Conditions {
    started: bool,
}

impl Conditions {
    fn new() -> Self {
        Self { started: false }
    }

    fn next(&mut self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(if self.started { " AND " } else { " WHERE " });
        self.started = true;
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &LedgerFilter) {
    let mut conds = Conditions::new();

    match filter.counterparty {
        Some(CounterpartyFilter::Supplier(id)) => {
            conds.next(qb);
            qb.push("m.fornecedor_id = ").push_bind(id);
        }
        Some(CounterpartyFilter::Payee(id)) => {
            conds.next(qb);
            qb.push("m.faturado_id = ").push_bind(id);
        }
        Some(CounterpartyFilter::Either(id)) => {
            conds.next(qb);
            qb.push("(m.fornecedor_id = ")
                .push_bind(id)
                .push(" OR m.faturado_id = ")
                .push_bind(id)
                .push(")");
        }
        None => {}
    }

    if let Some(kind) = filter.movement_type {
        conds.next(qb);
        qb.push("m.tipo_movimento = ").push_bind(kind.as_db());
    }
    if let Some(status) = filter.status {
        conds.next(qb);
        qb.push("m.status_pagamento = ").push_bind(status.as_db());
    }
    if let Some(from) = filter.issued_from {
        conds.next(qb);
        qb.push("m.data_emissao >= ").push_bind(from);
    }
    if let Some(to) = filter.issued_to {
        conds.next(qb);
        qb.push("m.data_emissao <= ").push_bind(to);
    }
}

/// `(nome ILIKE $a OR documento ILIKE $a) OR (...)` para cada patrón.
fn push_name_patterns(qb: &mut QueryBuilder<'_, Postgres>, patterns: &[String]) {
    qb.push("(");
    for (i, pattern) in patterns.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("(p.nome ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.documento ILIKE ")
            .push_bind(pattern.clone())
            .push(")");
    }
    qb.push(")");
}

/// Implementación de `Ledger` y `LedgerWriter` sobre Postgres.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn search_persons(
        &self,
        roles: &[Relationship],
        patterns: &[String],
        limit: i64,
    ) -> Result<Vec<Person>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {PERSON_COLUMNS} FROM Pessoas p"));
        let mut conds = Conditions::new();
        if !patterns.is_empty() {
            conds.next(&mut qb);
            push_name_patterns(&mut qb, patterns);
        }
        if !roles.is_empty() {
            conds.next(&mut qb);
            let codes: Vec<String> = roles.iter().map(|r| r.as_db().to_string()).collect();
            qb.push("p.tipo_relacionamento = ANY(").push_bind(codes).push(")");
        }
        qb.push(" ORDER BY p.nome ASC LIMIT ").push_bind(limit);

        let rows = qb.build_query_as::<PersonRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Person::from).collect())
    }

    async fn search_counterparties(
        &self,
        side: Side,
        patterns: &[String],
        limit: i64,
    ) -> Result<Vec<Counterparty>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PERSON_COLUMNS}, COUNT(m.id) AS qtd FROM MovimentoContas m JOIN Pessoas p ON {} = p.id",
            side.column()
        ));
        if !patterns.is_empty() {
            qb.push(" WHERE ");
            push_name_patterns(&mut qb, patterns);
        }
        qb.push(format!(" GROUP BY {PERSON_GROUP_BY} ORDER BY qtd DESC, p.nome ASC LIMIT "))
            .push_bind(limit);

        let rows = qb
            .build_query_as::<CounterpartyRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Counterparty {
                person: r.person.into(),
                entries: r.qtd,
            })
            .collect())
    }

    async fn totals(&self, filter: &LedgerFilter) -> Result<LedgerTotals> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS qtd, COALESCE(SUM(m.valor_total), 0)::float8 AS soma, \
             COALESCE(AVG(m.valor_total), 0)::float8 AS media, MAX(m.data_emissao) AS ultima \
             FROM MovimentoContas m",
        );
        push_filter(&mut qb, filter);

        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(LedgerTotals {
            count: row.try_get("qtd")?,
            sum: row.try_get("soma")?,
            average: row.try_get("media")?,
            last_issue: row.try_get("ultima")?,
        })
    }

    async fn entries(
        &self,
        filter: &LedgerFilter,
        order: EntryOrder,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {ENTRY_COLUMNS} FROM MovimentoContas m"));
        push_filter(&mut qb, filter);
        qb.push(match order {
            EntryOrder::MostRecent => " ORDER BY m.data_emissao DESC NULLS LAST, m.id DESC",
            EntryOrder::HighestValue => {
                " ORDER BY m.valor_total DESC NULLS LAST, m.data_emissao DESC NULLS LAST"
            }
        });
        qb.push(" LIMIT ").push_bind(limit);

        let rows = qb.build_query_as::<EntryRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn search_entries(&self, pattern: &str, limit: i64) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM MovimentoContas m \
             WHERE m.numero_documento ILIKE $1 OR m.descricao ILIKE $1 \
             ORDER BY m.data_emissao DESC NULLS LAST LIMIT $2"
        ))
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn search_classifications(
        &self,
        pattern: &str,
        limit: i64,
    ) -> Result<Vec<Classification>> {
        let rows = sqlx::query_as::<_, ClassificationRow>(&format!(
            "SELECT {CLASSIFICATION_COLUMNS} FROM Classificacao c \
             WHERE c.descricao ILIKE $1 OR c.categoria ILIKE $1 OR c.subcategoria ILIKE $1 \
             ORDER BY c.descricao ASC LIMIT $2"
        ))
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Classification::from).collect())
    }

    async fn person(&self, id: i32) -> Result<Option<Person>> {
        let row = sqlx::query_as::<_, PersonRow>(&format!(
            "SELECT {PERSON_COLUMNS} FROM Pessoas p WHERE p.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Person::from))
    }

    async fn entry(&self, id: i32) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM MovimentoContas m WHERE m.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LedgerEntry::from))
    }

    async fn classification(&self, id: i32) -> Result<Option<Classification>> {
        let row = sqlx::query_as::<_, ClassificationRow>(&format!(
            "SELECT {CLASSIFICATION_COLUMNS} FROM Classificacao c WHERE c.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Classification::from))
    }

    async fn installments(&self, entry_id: i32) -> Result<Vec<Installment>> {
        let rows = sqlx::query_as::<_, InstallmentRow>(
            "SELECT id, numero_parcela, data_vencimento, valor_parcela::float8 AS valor_parcela, \
             valor_pago::float8 AS valor_pago, status_parcela \
             FROM ParcelasContas WHERE movimento_id = $1 ORDER BY numero_parcela ASC",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Installment {
                id: r.id,
                number: r.numero_parcela.unwrap_or(1),
                due_date: r.data_vencimento,
                value: r.valor_parcela.unwrap_or(0.0),
                paid_value: r.valor_pago,
                status: r.status_parcela,
            })
            .collect())
    }

    async fn entry_classifications(&self, entry_id: i32) -> Result<Vec<EntryClassification>> {
        let rows = sqlx::query_as::<_, EntryClassificationRow>(
            "SELECT mc.classificacao_id, c.descricao, \
             mc.valor_classificacao::float8 AS valor_classificacao, \
             mc.percentual::float8 AS percentual \
             FROM MovimentoContas_has_Classificacao mc \
             JOIN Classificacao c ON mc.classificacao_id = c.id \
             WHERE mc.movimento_id = $1",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| EntryClassification {
                classification_id: r.classificacao_id,
                description: r.descricao.unwrap_or_default(),
                value: r.valor_classificacao.unwrap_or(0.0),
                percentage: r.percentual,
            })
            .collect())
    }

    async fn classification_usage(&self, classification_id: i32) -> Result<(i64, f64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS qtd, COALESCE(SUM(valor_classificacao), 0)::float8 AS total \
             FROM MovimentoContas_has_Classificacao WHERE classificacao_id = $1",
        )
        .bind(classification_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("qtd")?, row.try_get("total")?))
    }

    async fn classification_entries(
        &self,
        classification_id: i32,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM MovimentoContas_has_Classificacao mc \
             JOIN MovimentoContas m ON mc.movimento_id = m.id \
             WHERE mc.classificacao_id = $1 \
             ORDER BY m.data_emissao DESC NULLS LAST LIMIT $2"
        ))
        .bind(classification_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn list_persons(&self, limit: i64) -> Result<Vec<Person>> {
        let rows = sqlx::query_as::<_, PersonRow>(&format!(
            "SELECT {PERSON_COLUMNS} FROM Pessoas p ORDER BY p.id ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Person::from).collect())
    }

    async fn list_entries(&self, limit: i64) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM MovimentoContas m ORDER BY m.id ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn list_classifications(&self, limit: i64) -> Result<Vec<Classification>> {
        let rows = sqlx::query_as::<_, ClassificationRow>(&format!(
            "SELECT {CLASSIFICATION_COLUMNS} FROM Classificacao c ORDER BY c.id ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Classification::from).collect())
    }

    async fn table_schemas(&self) -> Result<Vec<TableSchema>> {
        let rows = sqlx::query(
            "SELECT table_name::text AS table_name, column_name::text AS column_name, \
             data_type::text AS data_type, is_nullable::text AS is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name <> 'rag_embeddings' \
             ORDER BY table_name, ordinal_position",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let column = ColumnSchema {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get::<String, _>("is_nullable")? == "YES",
            };
            match tables.last_mut() {
                Some(last) if last.name == table => last.columns.push(column),
                _ => tables.push(TableSchema {
                    name: table,
                    columns: vec![column],
                }),
            }
        }
        Ok(tables)
    }

    async fn run_read_only(&self, sql: &str) -> Result<Vec<Map<String, Value>>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query("SET LOCAL statement_timeout = '5s'")
            .execute(&mut *tx)
            .await?;

        let wrapped = format!("SELECT row_to_json(t)::jsonb FROM ({sql}) AS t");
        debug!("Ejecutando SQL generado: {wrapped}");
        let rows: Vec<Json<Value>> = sqlx::query_scalar(&wrapped).fetch_all(&mut *tx).await?;
        tx.rollback().await?;

        Ok(rows
            .into_iter()
            .filter_map(|Json(value)| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl LedgerWriter for PgLedger {
    async fn find_person_by_document(
        &self,
        role: Relationship,
        document: &str,
    ) -> Result<Option<Person>> {
        let row = sqlx::query_as::<_, PersonRow>(&format!(
            r"SELECT {PERSON_COLUMNS} FROM Pessoas p
              WHERE p.tipo_relacionamento = $1
                AND regexp_replace(COALESCE(p.documento, ''), '\D', '', 'g') = $2
              ORDER BY p.id ASC LIMIT 1"
        ))
        .bind(role.as_db())
        .bind(digits_only(document))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Person::from))
    }

    async fn find_expense_classification(
        &self,
        description: &str,
    ) -> Result<Option<Classification>> {
        let row = sqlx::query_as::<_, ClassificationRow>(&format!(
            "SELECT {CLASSIFICATION_COLUMNS} FROM Classificacao c \
             WHERE c.tipo = 'DESPESA' AND UPPER(c.descricao) = UPPER($1) \
             ORDER BY c.id ASC LIMIT 1"
        ))
        .bind(description.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Classification::from))
    }

    async fn create_person(
        &self,
        role: Relationship,
        name: &str,
        document: &str,
    ) -> Result<Person> {
        let kind = if digits_only(document).len() > 11 {
            "JURIDICA"
        } else {
            "FISICA"
        };
        let row = sqlx::query_as::<_, PersonRow>(
            "INSERT INTO Pessoas (tipo_relacionamento, nome, tipo_pessoa, documento, ativo) \
             VALUES ($1, $2, $3, $4, TRUE) \
             RETURNING id, nome, documento, tipo_relacionamento, ativo, endereco",
        )
        .bind(role.as_db())
        .bind(name)
        .bind(kind)
        .bind(document)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn create_expense_classification(&self, description: &str) -> Result<Classification> {
        let row = sqlx::query_as::<_, ClassificationRow>(
            "INSERT INTO Classificacao (tipo, descricao, ativo) VALUES ('DESPESA', $1, TRUE) \
             RETURNING id, descricao, tipo, categoria, subcategoria",
        )
        .bind(description.trim())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn find_duplicate_entry(&self, key: &DuplicateKey) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM MovimentoContas m \
             WHERE m.numero_documento IS NOT DISTINCT FROM $1 \
               AND m.data_emissao IS NOT DISTINCT FROM $2 \
               AND round(m.valor_total::numeric, 2) = round($3::numeric, 2) \
               AND m.fornecedor_id = $4 AND m.faturado_id = $5 \
             LIMIT 1"
        ))
        .bind(key.document_number.as_deref())
        .bind(key.issue_date)
        .bind(key.total_value)
        .bind(key.supplier_id)
        .bind(key.payee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LedgerEntry::from))
    }

    async fn record_entry(&self, entry: &NewLedgerEntry) -> Result<RecordedEntry> {
        // Si algo falla, `tx` se descarta sin commit y Postgres hace rollback.
        let mut tx = self.pool.begin().await?;

        let entry_id: i32 = sqlx::query_scalar(
            "INSERT INTO MovimentoContas (tipo_movimento, numero_documento, data_emissao, \
             data_vencimento, descricao, status_pagamento, valor_total, fornecedor_id, faturado_id) \
             VALUES ($1, $2, $3, $4, $5, 'PENDENTE', $6, $7, $8) RETURNING id",
        )
        .bind(entry.movement_type.as_db())
        .bind(entry.document_number.as_deref())
        .bind(entry.issue_date)
        .bind(entry.due_date)
        .bind(&entry.description)
        .bind(entry.total_value)
        .bind(entry.supplier_id)
        .bind(entry.payee_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO MovimentoContas_has_Classificacao \
             (movimento_id, classificacao_id, valor_classificacao, percentual) \
             VALUES ($1, $2, $3, 100)",
        )
        .bind(entry_id)
        .bind(entry.classification_id)
        .bind(entry.total_value)
        .execute(&mut *tx)
        .await?;

        let mut installment_ids = Vec::with_capacity(entry.installments.len());
        for installment in &entry.installments {
            let id: i32 = sqlx::query_scalar(
                "INSERT INTO ParcelasContas \
                 (movimento_id, numero_parcela, data_vencimento, valor_parcela, status_parcela) \
                 VALUES ($1, $2, $3, $4, 'PENDENTE') RETURNING id",
            )
            .bind(entry_id)
            .bind(installment.number)
            .bind(installment.due_date.or(entry.due_date).or(entry.issue_date))
            .bind(installment.value)
            .fetch_one(&mut *tx)
            .await?;
            installment_ids.push(id);
        }

        tx.commit().await?;
        Ok(RecordedEntry {
            entry_id,
            installment_ids,
        })
    }
}

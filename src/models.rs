//! Modelos de dominio (pessoas, movimentos, classificações y fuentes citadas).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Tipo de relación de una `Pessoa` con la empresa (`tipo_relacionamento`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    #[serde(rename = "FORNECEDOR")]
    Supplier,
    #[serde(rename = "CLIENTE")]
    Client,
    #[serde(rename = "FATURADO")]
    Payee,
    #[serde(rename = "FORNECEDOR_CLIENTE")]
    SupplierClient,
}

impl Relationship {
    pub fn as_db(&self) -> &'static str {
        match self {
            Relationship::Supplier => "FORNECEDOR",
            Relationship::Client => "CLIENTE",
            Relationship::Payee => "FATURADO",
            Relationship::SupplierClient => "FORNECEDOR_CLIENTE",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "FORNECEDOR" => Some(Relationship::Supplier),
            "CLIENTE" => Some(Relationship::Client),
            "FATURADO" => Some(Relationship::Payee),
            "FORNECEDOR_CLIENTE" => Some(Relationship::SupplierClient),
            _ => None,
        }
    }

    /// Nombre del papel tal como aparece en las respuestas.
    pub fn label(&self) -> &'static str {
        match self {
            Relationship::Supplier => "fornecedor",
            Relationship::Client => "cliente",
            Relationship::Payee => "faturado",
            Relationship::SupplierClient => "fornecedor/cliente",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementType {
    #[serde(rename = "ENTRADA")]
    Inbound,
    #[serde(rename = "SAIDA")]
    Outbound,
}

impl MovementType {
    pub fn as_db(&self) -> &'static str {
        match self {
            MovementType::Inbound => "ENTRADA",
            MovementType::Outbound => "SAIDA",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "ENTRADA" => Some(MovementType::Inbound),
            "SAIDA" | "SAÍDA" => Some(MovementType::Outbound),
            _ => None,
        }
    }

    /// Calificador usado en las respuestas ("de compra" / "de venda").
    pub fn qualifier(&self) -> &'static str {
        match self {
            MovementType::Inbound => "de compra",
            MovementType::Outbound => "de venda",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[serde(rename = "PENDENTE")]
    Pending,
    #[serde(rename = "PAGO")]
    Paid,
    #[serde(rename = "VENCIDO")]
    Overdue,
    #[serde(rename = "CANCELADO")]
    Cancelled,
}

impl PaymentStatus {
    pub fn as_db(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDENTE",
            PaymentStatus::Paid => "PAGO",
            PaymentStatus::Overdue => "VENCIDO",
            PaymentStatus::Cancelled => "CANCELADO",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "PENDENTE" => Some(PaymentStatus::Pending),
            "PAGO" => Some(PaymentStatus::Paid),
            "VENCIDO" => Some(PaymentStatus::Overdue),
            "CANCELADO" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pendente",
            PaymentStatus::Paid => "pago",
            PaymentStatus::Overdue => "vencido",
            PaymentStatus::Cancelled => "cancelado",
        }
    }
}

/// Registro de `Pessoas`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Person {
    pub id: i32,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "documento")]
    pub document: Option<String>,
    #[serde(rename = "tipo_relacionamento")]
    pub relationship: Option<Relationship>,
    #[serde(rename = "ativo")]
    pub active: bool,
    #[serde(rename = "endereco", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Person {
    /// Texto contra el que se compara un fragmento de nombre.
    pub fn match_text(&self) -> &str {
        if !self.name.trim().is_empty() {
            &self.name
        } else {
            self.document.as_deref().unwrap_or("")
        }
    }
}

/// Registro de `MovimentoContas`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i32,
    #[serde(rename = "numero_documento")]
    pub document_number: Option<String>,
    #[serde(rename = "data_emissao")]
    pub issue_date: Option<NaiveDate>,
    #[serde(rename = "data_vencimento")]
    pub due_date: Option<NaiveDate>,
    #[serde(rename = "descricao")]
    pub description: Option<String>,
    #[serde(rename = "valor_total")]
    pub total_value: f64,
    #[serde(rename = "tipo_movimento")]
    pub movement_type: Option<MovementType>,
    #[serde(rename = "status_pagamento")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(rename = "fornecedor_id")]
    pub supplier_id: Option<i32>,
    #[serde(rename = "faturado_id")]
    pub payee_id: Option<i32>,
}

/// Registro de `Classificacao`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub id: i32,
    #[serde(rename = "descricao")]
    pub description: String,
    #[serde(rename = "tipo")]
    pub kind: Option<String>,
    #[serde(rename = "categoria")]
    pub category: Option<String>,
    #[serde(rename = "subcategoria")]
    pub subcategory: Option<String>,
}

/// Registro de `ParcelasContas`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Installment {
    pub id: i32,
    #[serde(rename = "numero_parcela")]
    pub number: i32,
    #[serde(rename = "data_vencimento")]
    pub due_date: Option<NaiveDate>,
    #[serde(rename = "valor_parcela")]
    pub value: f64,
    #[serde(rename = "valor_pago")]
    pub paid_value: Option<f64>,
    #[serde(rename = "status_parcela")]
    pub status: Option<String>,
}

/// Asociación movimiento ↔ clasificación con el valor asignado.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryClassification {
    #[serde(rename = "classificacao_id")]
    pub classification_id: i32,
    #[serde(rename = "descricao")]
    pub description: String,
    #[serde(rename = "valor_classificacao")]
    pub value: f64,
    #[serde(rename = "percentual")]
    pub percentage: Option<f64>,
}

/// Tipo de entidad referenciada por un embedding o una fuente citada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefType {
    #[serde(rename = "Pessoas")]
    Person,
    #[serde(rename = "MovimentoContas")]
    LedgerEntry,
    #[serde(rename = "Classificacao")]
    Classification,
    #[serde(rename = "Schema")]
    Schema,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::Person => "Pessoas",
            RefType::LedgerEntry => "MovimentoContas",
            RefType::Classification => "Classificacao",
            RefType::Schema => "Schema",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Pessoas" => Some(RefType::Person),
            "MovimentoContas" => Some(RefType::LedgerEntry),
            "Classificacao" => Some(RefType::Classification),
            "Schema" => Some(RefType::Schema),
            _ => None,
        }
    }
}

/// Fuente citada junto a una respuesta, para que el frontend la enlace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kind: RefType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Source {
    pub fn person(person: &Person) -> Self {
        Self {
            id: person.id.to_string(),
            title: Some(person.name.clone()),
            kind: RefType::Person,
            score: None,
        }
    }

    pub fn entry(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            title: entry.document_number.clone(),
            kind: RefType::LedgerEntry,
            score: None,
        }
    }

    pub fn classification(classification: &Classification) -> Self {
        Self {
            id: classification.id.to_string(),
            title: Some(classification.description.clone()),
            kind: RefType::Classification,
            score: None,
        }
    }
}

/// Respuesta de `/rag/simple`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagAnswer {
    pub success: bool,
    pub answer: String,
    pub sources: Vec<Source>,
}

impl RagAnswer {
    pub fn new(answer: impl Into<String>, sources: Vec<Source>) -> Self {
        Self {
            success: true,
            answer: answer.into(),
            sources,
        }
    }
}

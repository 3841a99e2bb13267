//! Conciliación de una nota fiscal extraída con el cadastro: qué existe ya y
//! alta atómica del movimiento con su clasificación y sus parcelas.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{AppError, Result},
    invoice::Invoice,
    ledger::{DuplicateKey, LedgerWriter, NewInstallment, NewLedgerEntry},
    models::{MovementType, Person, Relationship},
};

pub const DUPLICATE_MOVEMENT: &str = "MOVIMENTO JÁ CADASTRADO";

/// Estado de un registro buscado en el cadastro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    pub exists: bool,
    pub id: Option<i32>,
    #[serde(default)]
    pub status: String,
}

impl Lookup {
    fn new(name: Option<String>, document: Option<String>, id: Option<i32>) -> Self {
        Self {
            name,
            document,
            exists: id.is_some(),
            status: match id {
                Some(id) => format!("EXISTE - ID: {id}"),
                None => "NÃO EXISTE".to_string(),
            },
            id,
        }
    }

    fn existing_id(&self) -> Option<i32> {
        if self.exists {
            self.id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(rename = "fornecedor")]
    pub supplier: Lookup,
    #[serde(rename = "faturado")]
    pub payee: Lookup,
    #[serde(rename = "despesa")]
    pub expense: Lookup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementCreated {
    pub supplier_created: bool,
    pub payee_created: bool,
    pub expense_created: bool,
    pub movement_id: i32,
    pub installment_ids: Vec<i32>,
}

/// Descripción de la clasificación de despesa dominante de la nota.
pub fn expense_description(invoice: &Invoice) -> Option<String> {
    let main = invoice
        .expenses
        .iter()
        .max_by(|a, b| a.percentage.total_cmp(&b.percentage))?;
    let subcategory = main.subcategory.trim();
    Some(if subcategory.is_empty() {
        main.category.code().to_string()
    } else {
        subcategory.to_string()
    })
}

pub struct Reconciler {
    writer: Arc<dyn LedgerWriter>,
}

impl Reconciler {
    pub fn new(writer: Arc<dyn LedgerWriter>) -> Self {
        Self { writer }
    }

    async fn find_party(&self, role: Relationship, document: Option<&str>) -> Result<Option<Person>> {
        match document {
            Some(doc) if !doc.trim().is_empty() => {
                self.writer.find_person_by_document(role, doc).await
            }
            _ => Ok(None),
        }
    }

    /// Busca fornecedor (CNPJ), faturado (CPF) y clasificación de despesa.
    pub async fn analyze(&self, invoice: &Invoice) -> Result<Analysis> {
        let supplier = self
            .find_party(Relationship::Supplier, invoice.supplier.cnpj.as_deref())
            .await?;
        let payee = self
            .find_party(Relationship::Payee, invoice.payee.cpf.as_deref())
            .await?;
        let description = expense_description(invoice);
        let expense = match &description {
            Some(d) => self.writer.find_expense_classification(d).await?,
            None => None,
        };

        Ok(Analysis {
            supplier: Lookup::new(
                invoice.supplier.display_name().map(str::to_string),
                invoice.supplier.cnpj.clone(),
                supplier.map(|p| p.id),
            ),
            payee: Lookup::new(
                invoice.payee.full_name.clone(),
                invoice.payee.cpf.clone(),
                payee.map(|p| p.id),
            ),
            expense: Lookup::new(description, None, expense.map(|c| c.id)),
        })
    }

    /// Id de la persona; la crea si no existe. Devuelve también si se creó.
    async fn ensure_party(
        &self,
        role: Relationship,
        known: &Lookup,
        name: Option<&str>,
        document: Option<&str>,
    ) -> Result<(i32, bool)> {
        if let Some(id) = known.existing_id() {
            return Ok((id, false));
        }
        if let Some(found) = self.find_party(role, document).await? {
            return Ok((found.id, false));
        }
        let label = role.label();
        let document = document
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| AppError::InvalidInput(format!("Documento do {label} é obrigatório.")))?;
        let name = name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| AppError::InvalidInput(format!("Nome do {label} é obrigatório.")))?;
        let created = self.writer.create_person(role, name, document).await?;
        info!("{label} criado: {} (id={})", created.name, created.id);
        Ok((created.id, true))
    }

    async fn ensure_expense(&self, known: &Lookup, description: &str) -> Result<(i32, bool)> {
        if let Some(id) = known.existing_id() {
            return Ok((id, false));
        }
        if let Some(found) = self.writer.find_expense_classification(description).await? {
            return Ok((found.id, false));
        }
        let created = self.writer.create_expense_classification(description).await?;
        info!("Classificação de despesa criada: {} (id={})", created.description, created.id);
        Ok((created.id, true))
    }

    /// Da de alta lo que falte y registra el movimiento (SAIDA, PENDENTE) con
    /// su clasificación y parcelas en una sola transacción.
    pub async fn create_movement(
        &self,
        invoice: &Invoice,
        analysis: &Analysis,
    ) -> Result<MovementCreated> {
        if invoice.total_value <= 0.0 {
            return Err(AppError::InvalidInput(
                "Valor total deve ser maior que zero".into(),
            ));
        }
        let description = expense_description(invoice).ok_or_else(|| {
            AppError::InvalidInput("Classificação de despesa é obrigatória.".into())
        })?;

        let (supplier_id, supplier_created) = self
            .ensure_party(
                Relationship::Supplier,
                &analysis.supplier,
                invoice.supplier.display_name(),
                invoice.supplier.cnpj.as_deref(),
            )
            .await?;
        let (payee_id, payee_created) = self
            .ensure_party(
                Relationship::Payee,
                &analysis.payee,
                invoice.payee.full_name.as_deref(),
                invoice.payee.cpf.as_deref(),
            )
            .await?;
        let (classification_id, expense_created) =
            self.ensure_expense(&analysis.expense, &description).await?;

        let key = DuplicateKey {
            document_number: invoice.number.clone(),
            issue_date: invoice.issue_date,
            total_value: invoice.total_value,
            supplier_id,
            payee_id,
        };
        if let Some(existing) = self.writer.find_duplicate_entry(&key).await? {
            info!("Movimento duplicado: já existe como id={}", existing.id);
            return Err(AppError::Conflict(DUPLICATE_MOVEMENT.into()));
        }

        let installments: Vec<NewInstallment> = invoice
            .installments
            .iter()
            .map(|p| NewInstallment {
                number: p.number,
                due_date: p.due_date.or(invoice.issue_date),
                value: p.value,
            })
            .collect();
        let entry = NewLedgerEntry {
            document_number: invoice.number.clone(),
            issue_date: invoice.issue_date,
            due_date: invoice
                .installments
                .iter()
                .find_map(|p| p.due_date)
                .or(invoice.issue_date),
            description: format!(
                "Nota Fiscal {} - {}",
                invoice.number.as_deref().unwrap_or("s/n"),
                invoice.supplier.display_name().unwrap_or("")
            ),
            total_value: invoice.total_value,
            movement_type: MovementType::Outbound,
            supplier_id,
            payee_id,
            classification_id,
            installments,
        };
        let recorded = self.writer.record_entry(&entry).await?;
        info!(
            "Movimento {} lançado com {} parcela(s)",
            recorded.entry_id,
            recorded.installment_ids.len()
        );

        Ok(MovementCreated {
            supplier_created,
            payee_created,
            expense_created,
            movement_id: recorded.entry_id,
            installment_ids: recorded.installment_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{ExpenseCategory, ExpenseShare, InvoiceInstallment, InvoicePayee, InvoiceSupplier};
    use crate::testing::{date, person, LedgerData, MemoryLedger};
    use tokio_test::{assert_err, assert_ok};

    fn invoice() -> Invoice {
        Invoice {
            supplier: InvoiceSupplier {
                legal_name: Some("Agro Sul Ltda".into()),
                trade_name: None,
                cnpj: Some("12.345.678/0001-90".into()),
            },
            payee: InvoicePayee {
                full_name: Some("João da Silva".into()),
                cpf: Some("123.456.789-00".into()),
            },
            number: Some("4512".into()),
            issue_date: Some(date("2024-03-01")),
            products: Some("Sementes de soja".into()),
            installments: vec![
                InvoiceInstallment {
                    number: 1,
                    due_date: Some(date("2024-04-01")),
                    value: 600.0,
                },
                InvoiceInstallment {
                    number: 2,
                    due_date: None,
                    value: 600.0,
                },
            ],
            total_value: 1200.0,
            expenses: vec![ExpenseShare {
                category: ExpenseCategory::AgriculturalInputs,
                subcategory: "Sementes".into(),
                percentage: 100.0,
                value: 1200.0,
                rationale: "Sementes de soja".into(),
            }],
        }
    }

    fn ledger() -> Arc<MemoryLedger> {
        let mut supplier = person(1, "Agro Sul Ltda", Relationship::Supplier);
        supplier.document = Some("12345678000190".into());
        Arc::new(MemoryLedger::new(LedgerData {
            persons: vec![supplier],
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn analysis_matches_documents_by_digits() {
        let reconciler = Reconciler::new(ledger());
        let analysis = reconciler.analyze(&invoice()).await.unwrap();

        assert!(analysis.supplier.exists);
        assert_eq!(analysis.supplier.id, Some(1));
        assert_eq!(analysis.supplier.status, "EXISTE - ID: 1");
        assert!(!analysis.payee.exists);
        assert_eq!(analysis.payee.status, "NÃO EXISTE");
        assert_eq!(analysis.expense.name.as_deref(), Some("Sementes"));
        assert!(!analysis.expense.exists);
    }

    #[tokio::test]
    async fn creates_missing_records_and_the_movement() {
        let ledger = ledger();
        let reconciler = Reconciler::new(ledger.clone());
        let analysis = reconciler.analyze(&invoice()).await.unwrap();

        let created = reconciler.create_movement(&invoice(), &analysis).await.unwrap();
        assert!(!created.supplier_created);
        assert!(created.payee_created);
        assert!(created.expense_created);
        assert_eq!(created.installment_ids.len(), 2);

        let data = ledger.snapshot();
        let entry = data.entries.iter().find(|e| e.id == created.movement_id).unwrap();
        assert_eq!(entry.movement_type, Some(MovementType::Outbound));
        assert_eq!(entry.supplier_id, Some(1));
        assert_eq!(entry.description.as_deref(), Some("Nota Fiscal 4512 - Agro Sul Ltda"));
        // Parcela sin vencimiento: vence en la fecha de emisión.
        assert_eq!(data.installments[1].1.due_date, Some(date("2024-03-01")));
    }

    #[tokio::test]
    async fn duplicate_movements_are_rejected() {
        let ledger = ledger();
        let reconciler = Reconciler::new(ledger.clone());
        let analysis = reconciler.analyze(&invoice()).await.unwrap();
        assert_ok!(reconciler.create_movement(&invoice(), &analysis).await);

        // Análisis obsoleto: las búsquedas previas evitan altas repetidas.
        let err = assert_err!(reconciler.create_movement(&invoice(), &analysis).await);
        assert!(matches!(err, AppError::Conflict(ref m) if m == DUPLICATE_MOVEMENT));
        let data = ledger.snapshot();
        assert_eq!(data.entries.len(), 1);
        assert_eq!(data.persons.len(), 2);
    }

    #[tokio::test]
    async fn failed_write_leaves_no_movement() {
        let mut supplier = person(1, "Agro Sul Ltda", Relationship::Supplier);
        supplier.document = Some("12345678000190".into());
        let ledger = Arc::new(MemoryLedger::new(LedgerData {
            persons: vec![supplier],
            fail_installments: true,
            ..Default::default()
        }));
        let reconciler = Reconciler::new(ledger.clone());
        let analysis = reconciler.analyze(&invoice()).await.unwrap();

        assert_err!(reconciler.create_movement(&invoice(), &analysis).await);
        let data = ledger.snapshot();
        assert!(data.entries.is_empty());
        assert!(data.installments.is_empty());
    }

    #[tokio::test]
    async fn zero_total_is_invalid() {
        let reconciler = Reconciler::new(ledger());
        let mut bad = invoice();
        bad.total_value = 0.0;
        let analysis = reconciler.analyze(&bad).await.unwrap();
        assert!(matches!(
            reconciler.create_movement(&bad, &analysis).await,
            Err(AppError::InvalidInput(_))
        ));
    }
}

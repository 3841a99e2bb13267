//! Respuestas directas desde el libro de movimientos: NLQ por intención,
//! resumen por nombre y la heurística antigua de "notas del fornecedor X".

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::detect::{extract_bare_name, extract_quoted, EntityRole, Intent, Metric};
use crate::error::Result;
use crate::format::{format_brl, format_date_br, squash_spaces};
use crate::ledger::{like_pattern, CounterpartyFilter, EntryOrder, Ledger, LedgerFilter};
use crate::models::{LedgerEntry, Person, RagAnswer, Source};
use crate::resolver::{similarity_score, PersonResolver};

/// Entradas listadas como máximo en el modo lista.
const LIST_LIMIT: i64 = 10;
/// Movimientos citados como fuente.
const CITED_ENTRIES: usize = 3;

/// Palabras que indican que la pregunta no es sólo un nombre.
const METRIC_WORDS: &[&str] = &[
    "valores", "listar", "lista", "soma", "total", "quantas", "qtd", "número", "numero",
    "contagem", "notas", "compra", "venda",
];

static AFTER_SUPPLIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is).*fornecedor\s*").unwrap());

fn notes_term(count: i64) -> &'static str {
    if count == 1 {
        "nota"
    } else {
        "notas"
    }
}

/// "valor de A" / "valores de A e B" / "valores como A, B, C, entre outras".
pub fn enumerate_values(values: &[f64]) -> String {
    let formatted: Vec<String> = values.iter().map(|v| format_brl(*v)).collect();
    match formatted.as_slice() {
        [] => String::new(),
        [one] => format!("valor de {one}"),
        [a, b] => format!("valores de {a} e {b}"),
        many => {
            let shown = many[..3].join(", ");
            let rest = if formatted.len() > 3 { ", entre outras" } else { "" };
            format!("valores como {shown}{rest}")
        }
    }
}

fn cite(person: Option<&Person>, entries: &[LedgerEntry]) -> Vec<Source> {
    person
        .map(Source::person)
        .into_iter()
        .chain(entries.iter().take(CITED_ENTRIES).map(Source::entry))
        .collect()
}

/// Persona resuelta junto con el papel con el que se la mencionó; sin papel
/// cuando la pregunta sólo traía el nombre.
struct Subject {
    role: Option<EntityRole>,
    person: Person,
}

impl Subject {
    /// "O fornecedor X" / "X"
    fn nominative(&self) -> String {
        match self.role {
            Some(role) => format!("O {} {}", role.keyword(), self.person.name),
            None => self.person.name.clone(),
        }
    }

    /// "do fornecedor X" / "de X"
    fn genitive(&self) -> String {
        match self.role {
            Some(role) => format!("do {} {}", role.keyword(), self.person.name),
            None => format!("de {}", self.person.name),
        }
    }

    fn filter(&self) -> CounterpartyFilter {
        match self.role {
            Some(EntityRole::Supplier) => CounterpartyFilter::Supplier(self.person.id),
            Some(EntityRole::Client | EntityRole::Payee) => {
                CounterpartyFilter::Payee(self.person.id)
            }
            None => CounterpartyFilter::Either(self.person.id),
        }
    }

    /// Sólo se cita la persona cuando se la nombró con su papel.
    fn cited(&self) -> Option<&Person> {
        self.role.map(|_| &self.person)
    }
}

pub struct AnswerBuilder {
    ledger: Arc<dyn Ledger>,
    resolver: PersonResolver,
    threshold: f64,
}

impl AnswerBuilder {
    pub fn new(ledger: Arc<dyn Ledger>, threshold: f64) -> Self {
        Self {
            resolver: PersonResolver::new(ledger.clone(), threshold),
            ledger,
            threshold,
        }
    }

    pub fn resolver(&self) -> &PersonResolver {
        &self.resolver
    }

    /// Responde combinando contraparte, tipo, estado y periodo detectados.
    ///
    /// `None` si no hay nada accionable o si la contraparte nombrada no se
    /// pudo resolver, para que la cadena pase a la siguiente estrategia.
    pub async fn answer_nlq(&self, text: &str) -> Result<Option<RagAnswer>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let intent = Intent::detect(text);
        if !intent.is_actionable() {
            return Ok(None);
        }

        let subject = match intent.counterparty() {
            Some((role, name)) => match self.resolver.resolve(role, name).await? {
                Some(person) => Some(Subject {
                    role: Some(role),
                    person,
                }),
                None => {
                    debug!("No se pudo resolver la contraparte '{name}'");
                    return Ok(None);
                }
            },
            None if intent.entity.role.is_none() && intent.metric.is_some() => {
                match extract_bare_name(text) {
                    Some(name) => match self.resolve_any_role(&name).await? {
                        Some(person) => Some(Subject { role: None, person }),
                        None => {
                            debug!("'{name}' no corresponde a ninguna contraparte");
                            return Ok(None);
                        }
                    },
                    None => None,
                }
            }
            None => None,
        };

        let filter = LedgerFilter {
            counterparty: subject.as_ref().map(Subject::filter),
            movement_type: intent.movement_type,
            status: intent.status,
            issued_from: intent.period.as_ref().map(|p| p.start.date()),
            issued_to: intent.period.as_ref().map(|p| p.end.date()),
        };

        let kind = intent.movement_type.map(|t| t.qualifier()).unwrap_or("");
        let period = intent
            .period
            .as_ref()
            .map(|p| format!(" {}", p.label))
            .unwrap_or_default();
        let status = intent
            .status
            .map(|s| format!(" {}", s.label()))
            .unwrap_or_default();
        let qualifiers = squash_spaces(&format!("{kind}{period}{status}"));
        let after_notes = if qualifiers.is_empty() {
            String::new()
        } else {
            format!(" {qualifiers}")
        };
        let who = subject.as_ref().map(Subject::genitive).unwrap_or_default();
        let person = subject.as_ref().and_then(Subject::cited);

        let metric = intent.metric.unwrap_or(Metric::List);
        let answer = match metric {
            Metric::Average | Metric::Count | Metric::Sum => {
                let totals = self.ledger.totals(&filter).await?;
                let recent = self
                    .ledger
                    .entries(&filter, EntryOrder::MostRecent, CITED_ENTRIES as i64)
                    .await?;
                let notes = notes_term(totals.count);
                let text = match metric {
                    Metric::Average => {
                        let head = squash_spaces(&format!("Média {kind} {who}{period}{status}"));
                        format!(
                            "{head}: {} (em {} {notes}).",
                            format_brl(totals.average),
                            totals.count
                        )
                    }
                    Metric::Count => match &subject {
                        Some(s) => format!(
                            "{} possui {} {notes}{after_notes}. Soma: {}.",
                            s.nominative(),
                            totals.count,
                            format_brl(totals.sum)
                        ),
                        None => format!(
                            "Foram encontradas {} {notes}{after_notes}. Soma: {}.",
                            totals.count,
                            format_brl(totals.sum)
                        ),
                    },
                    _ => {
                        let head = squash_spaces(&format!("Total {kind} {who}{period}{status}"));
                        format!(
                            "{head}: {} (em {} {notes}).",
                            format_brl(totals.sum),
                            totals.count
                        )
                    }
                };
                RagAnswer::new(squash_spaces(&text), cite(person, &recent))
            }
            Metric::List => {
                let entries = self
                    .ledger
                    .entries(&filter, EntryOrder::MostRecent, LIST_LIMIT)
                    .await?;
                if entries.is_empty() {
                    let text = format!("Não encontrei notas {kind} {who}{period}{status}");
                    RagAnswer::new(format!("{}.", squash_spaces(&text)), cite(person, &[]))
                } else {
                    let count = entries.len() as i64;
                    let values: Vec<f64> = entries.iter().map(|e| e.total_value).collect();
                    let listed = enumerate_values(&values);
                    let text = match &subject {
                        Some(s) => format!(
                            "{} tem {count} {}{after_notes} com {listed}.",
                            s.nominative(),
                            notes_term(count)
                        ),
                        None => format!(
                            "Foram encontradas {count} {}{after_notes} com {listed}.",
                            notes_term(count)
                        ),
                    };
                    RagAnswer::new(squash_spaces(&text), cite(person, &entries))
                }
            }
        };
        Ok(Some(answer))
    }

    /// Resuelve un nombre sin papel como fornecedor, cliente o faturado, en
    /// ese orden. La búsqueda por frecuencia siempre devuelve a alguien; aquí
    /// sólo vale un parecido real con el nombre.
    async fn resolve_any_role(&self, name: &str) -> Result<Option<Person>> {
        for role in [EntityRole::Supplier, EntityRole::Client, EntityRole::Payee] {
            if let Some(found) = self.resolver.resolve(role, name).await? {
                if similarity_score(name, found.match_text()) >= self.threshold {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    /// Resumen de una persona cuando la pregunta es sólo un nombre.
    pub async fn answer_name_overview(&self, text: &str) -> Result<Option<RagAnswer>> {
        let text = text.trim();
        let lower = text.to_lowercase();
        if text.is_empty() || METRIC_WORDS.iter().any(|w| lower.contains(w)) {
            return Ok(None);
        }
        let name = extract_quoted(text).unwrap_or_else(|| text.to_string());
        if name.chars().count() < 2 {
            return Ok(None);
        }

        let Some(person) = self.resolve_any_role(&name).await? else {
            return Ok(None);
        };

        let filter = LedgerFilter {
            counterparty: Some(CounterpartyFilter::Either(person.id)),
            ..Default::default()
        };
        let totals = self.ledger.totals(&filter).await?;
        let top = self
            .ledger
            .entries(&filter, EntryOrder::HighestValue, 3)
            .await?;

        let role = person
            .relationship
            .map(|r| r.label())
            .unwrap_or("fornecedor/cliente");
        let mut text = format!(
            "O {role} {} possui {} {}, total de {}.",
            person.name,
            totals.count,
            notes_term(totals.count),
            format_brl(totals.sum)
        );
        if let Some(last) = totals.last_issue {
            text.push_str(&format!(" Última emissão em {}.", format_date_br(last)));
        }
        let values: Vec<String> = top.iter().map(|e| format_brl(e.total_value)).collect();
        match values.as_slice() {
            [] => {}
            [one] => text.push_str(&format!(" Principal valor de {one}.")),
            [a, b] => text.push_str(&format!(" Principais valores de {a} e {b}.")),
            many => text.push_str(&format!(" Principais valores como {}.", many.join(", "))),
        }

        let mut sources = vec![Source::person(&person)];
        sources.extend(top.iter().map(Source::entry));
        Ok(Some(RagAnswer::new(squash_spaces(&text), sources)))
    }

    /// "valores das notas do fornecedor X": lista las notas en las que X
    /// aparece como fornecedor o faturado.
    pub async fn answer_legacy_supplier(&self, text: &str) -> Result<Option<RagAnswer>> {
        let text = text.trim();
        if !text.to_lowercase().contains("fornecedor") {
            return Ok(None);
        }
        let name = extract_quoted(text)
            .unwrap_or_else(|| AFTER_SUPPLIER.replace(text, "").trim().to_string());
        if name.chars().count() < 2 {
            return Ok(None);
        }

        let found = self
            .ledger
            .search_persons(&[], &[like_pattern(&name)], 1)
            .await?;
        let Some(person) = found.into_iter().next() else {
            return Ok(Some(RagAnswer::new(
                format!("Não encontrei fornecedor compatível com \"{name}\" no cadastro."),
                Vec::new(),
            )));
        };

        let filter = LedgerFilter {
            counterparty: Some(CounterpartyFilter::Either(person.id)),
            ..Default::default()
        };
        let entries = self
            .ledger
            .entries(&filter, EntryOrder::MostRecent, LIST_LIMIT)
            .await?;
        if entries.is_empty() {
            return Ok(Some(RagAnswer::new(
                format!(
                    "O fornecedor {} não possui notas fiscais registradas.",
                    person.name
                ),
                vec![Source::person(&person)],
            )));
        }

        let count = entries.len();
        let values: Vec<f64> = entries.iter().map(|e| e.total_value).collect();
        let term = if count == 1 {
            "nota fiscal"
        } else {
            "notas fiscais"
        };
        let answer = format!(
            "O fornecedor {} tem {count} {term}, com {}.",
            person.name,
            enumerate_values(&values)
        );
        Ok(Some(RagAnswer::new(answer, cite(Some(&person), &entries))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MovementType, PaymentStatus, RefType, Relationship};
    use crate::testing::{entry, person, LedgerData, MemoryLedger};

    fn acme_ledger() -> LedgerData {
        LedgerData {
            persons: vec![
                person(1, "Acme Ltda", Relationship::Supplier),
                person(2, "Beta SA", Relationship::Client),
                person(3, "Gama Ltda", Relationship::Supplier),
            ],
            entries: vec![
                entry(10, "2024-01-10", 100.0, MovementType::Outbound, 1, 2),
                entry(11, "2024-01-11", 200.0, MovementType::Outbound, 1, 2),
                entry(12, "2024-01-09", 500.0, MovementType::Outbound, 3, 2),
            ],
            ..Default::default()
        }
    }

    fn builder(data: LedgerData) -> AnswerBuilder {
        AnswerBuilder::new(Arc::new(MemoryLedger::new(data)), 0.3)
    }

    #[test]
    fn enumerates_values_by_count() {
        assert_eq!(enumerate_values(&[10.0]), "valor de R$ 10,00");
        assert_eq!(
            enumerate_values(&[10.0, 20.0]),
            "valores de R$ 10,00 e R$ 20,00"
        );
        assert_eq!(
            enumerate_values(&[1.0, 2.0, 3.0]),
            "valores como R$ 1,00, R$ 2,00, R$ 3,00"
        );
        assert_eq!(
            enumerate_values(&[1.0, 2.0, 3.0, 4.0]),
            "valores como R$ 1,00, R$ 2,00, R$ 3,00, entre outras"
        );
    }

    #[tokio::test]
    async fn sums_sales_of_a_name_without_role() {
        let answer = builder(acme_ledger())
            .answer_nlq("quanto a Acme vendeu no total")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.answer, "Total de Acme Ltda: R$ 300,00 (em 2 notas).");
        assert_eq!(answer.sources.len(), 2);
        assert!(answer.sources.iter().all(|s| s.kind == RefType::LedgerEntry));
        assert_eq!(answer.sources[0].id, "11");
    }

    #[tokio::test]
    async fn sums_everything_without_a_name() {
        let answer = builder(acme_ledger())
            .answer_nlq("valor total das vendas")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.answer, "Total de venda: R$ 800,00 (em 3 notas).");
    }

    #[tokio::test]
    async fn unknown_bare_name_falls_through() {
        let result = builder(acme_ledger())
            .answer_nlq("quanto a Zeta vendeu no total")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn counts_notes_of_a_supplier() {
        let answer = builder(acme_ledger())
            .answer_nlq("quantas notas do fornecedor Acme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            answer.answer,
            "O fornecedor Acme Ltda possui 2 notas. Soma: R$ 300,00."
        );
        assert_eq!(answer.sources[0].kind, RefType::Person);
        assert_eq!(answer.sources[0].id, "1");
        assert_eq!(answer.sources[1].id, "11");
        assert_eq!(answer.sources.len(), 3);
    }

    #[tokio::test]
    async fn averages_purchases_in_a_year() {
        let mut data = acme_ledger();
        for e in &mut data.entries {
            e.movement_type = Some(MovementType::Inbound);
        }
        let answer = builder(data)
            .answer_nlq("média das compras em 2024")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.answer, "Média de compra em 2024: R$ 266,67 (em 3 notas).");
    }

    #[tokio::test]
    async fn lists_a_single_sale_of_a_client() {
        let mut data = acme_ledger();
        data.entries.truncate(1);
        let answer = builder(data)
            .answer_nlq("listar vendas do cliente Beta")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            answer.answer,
            "O cliente Beta SA tem 1 nota de venda com valor de R$ 100,00."
        );
    }

    #[tokio::test]
    async fn empty_result_is_answered_explicitly() {
        let mut data = acme_ledger();
        data.entries[0].payment_status = Some(PaymentStatus::Paid);
        let answer = builder(data)
            .answer_nlq("notas pagas em 2023")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.answer, "Não encontrei notas em 2023 pago.");
        assert!(answer.sources.is_empty());
    }

    #[tokio::test]
    async fn unactionable_questions_fall_through() {
        let result = builder(acme_ledger())
            .answer_nlq("olá, tudo bem?")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn overview_for_a_bare_name() {
        let answer = builder(acme_ledger())
            .answer_name_overview("Acme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            answer.answer,
            "O fornecedor Acme Ltda possui 2 notas, total de R$ 300,00. \
             Última emissão em 11/01/2024. Principais valores de R$ 200,00 e R$ 100,00."
        );
        assert_eq!(answer.sources.len(), 3);
        assert_eq!(answer.sources[1].id, "11");
    }

    #[tokio::test]
    async fn overview_skips_metric_questions_and_unknown_names() {
        let b = builder(acme_ledger());
        assert!(b.answer_name_overview("total da Acme").await.unwrap().is_none());
        assert!(b.answer_name_overview("Zeta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_reports_unknown_supplier() {
        let answer = builder(LedgerData::default())
            .answer_legacy_supplier("notas do fornecedor Zeta")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            answer.answer,
            "Não encontrei fornecedor compatível com \"Zeta\" no cadastro."
        );
    }

    #[tokio::test]
    async fn legacy_lists_supplier_notes() {
        let answer = builder(acme_ledger())
            .answer_legacy_supplier("valores do fornecedor Acme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            answer.answer,
            "O fornecedor Acme Ltda tem 2 notas fiscais, com valores de R$ 200,00 e R$ 100,00."
        );
    }
}

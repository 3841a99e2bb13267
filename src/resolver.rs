//! Resolución difusa de personas a partir de un fragmento de nombre o
//! documento, degradando de la coincidencia directa a la estadística.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::detect::EntityRole;
use crate::error::Result;
use crate::format::strip_accents;
use crate::ledger::{like_pattern, Ledger, Side};
use crate::models::{Person, Relationship};

/// Candidatos que se consideran en la búsqueda por frecuencia final.
const MOST_FREQUENT: i64 = 100;

/// Puntuación de parecido entre el fragmento buscado y un nombre guardado.
///
/// Igualdad → 1.0, prefijo → 0.95, contenido → 0.9; si no, la fracción de
/// palabras del fragmento presentes en el nombre, escalada por 0.6.
pub fn similarity_score(fragment: &str, stored: &str) -> f64 {
    let a = strip_accents(fragment);
    let b = strip_accents(stored);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if b.starts_with(&a) {
        return 0.95;
    }
    if b.contains(&a) {
        return 0.9;
    }

    let stored_tokens: HashSet<&str> = b.split_whitespace().collect();
    let tokens: Vec<&str> = a.split_whitespace().collect();
    let shared = tokens.iter().filter(|t| stored_tokens.contains(*t)).count();
    0.6 * shared as f64 / tokens.len().max(1) as f64
}

/// Relaciones compatibles con el papel pedido.
pub fn compatible_relationships(role: EntityRole) -> &'static [Relationship] {
    match role {
        EntityRole::Supplier => &[Relationship::Supplier, Relationship::SupplierClient],
        EntityRole::Client => &[Relationship::Client, Relationship::SupplierClient],
        EntityRole::Payee => &[Relationship::Payee, Relationship::SupplierClient],
    }
}

/// Columna del movimiento que identifica a la contraparte del papel.
pub fn side_for(role: EntityRole) -> Side {
    match role {
        EntityRole::Supplier => Side::Supplier,
        EntityRole::Client | EntityRole::Payee => Side::Payee,
    }
}

/// Palabras normalizadas de al menos 2 caracteres.
fn search_tokens(fragment: &str) -> Vec<String> {
    strip_accents(fragment)
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// Mejor candidato; ante empate se queda el primero (el más frecuente
/// cuando la lista viene ordenada por frecuencia).
fn best_match<'a>(
    fragment: &str,
    candidates: impl IntoIterator<Item = &'a Person>,
) -> Option<(&'a Person, f64)> {
    let mut best: Option<(&Person, f64)> = None;
    for person in candidates {
        let score = similarity_score(fragment, person.match_text());
        if best.map_or(true, |(_, current)| score > current) {
            best = Some((person, score));
        }
    }
    best
}

pub struct PersonResolver {
    ledger: Arc<dyn Ledger>,
    threshold: f64,
}

impl PersonResolver {
    pub fn new(ledger: Arc<dyn Ledger>, threshold: f64) -> Self {
        Self { ledger, threshold }
    }

    fn accept(&self, fragment: &str, candidates: &[Person], stage: &str) -> Option<Person> {
        match best_match(fragment, candidates) {
            Some((person, score)) if score >= self.threshold => {
                debug!("'{fragment}' resuelto en {stage} como {} ({score:.2})", person.name);
                Some(person.clone())
            }
            _ => None,
        }
    }

    /// Busca la persona a la que se refiere `fragment` con el papel `role`.
    pub async fn resolve(&self, role: EntityRole, fragment: &str) -> Result<Option<Person>> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Ok(None);
        }

        let roles = compatible_relationships(role);
        let direct = vec![like_pattern(fragment)];
        let tokens: Vec<String> = search_tokens(fragment)
            .iter()
            .map(|t| like_pattern(t))
            .collect();

        let found = self.ledger.search_persons(roles, &direct, 10).await?;
        if let Some(person) = self.accept(fragment, &found, "búsqueda directa") {
            return Ok(Some(person));
        }

        if !tokens.is_empty() {
            let found = self.ledger.search_persons(roles, &tokens, 20).await?;
            if let Some(person) = self.accept(fragment, &found, "búsqueda por palabras") {
                return Ok(Some(person));
            }
        }

        // Contrapartes que aparecen en movimientos, ya ordenadas por frecuencia.
        let side = side_for(role);
        let joined = self.ledger.search_counterparties(side, &direct, 10).await?;
        let persons: Vec<Person> = joined.into_iter().map(|c| c.person).collect();
        if let Some(person) = self.accept(fragment, &persons, "movimientos") {
            return Ok(Some(person));
        }

        if !tokens.is_empty() {
            let joined = self.ledger.search_counterparties(side, &tokens, 20).await?;
            let persons: Vec<Person> = joined.into_iter().map(|c| c.person).collect();
            if let Some(person) = self.accept(fragment, &persons, "movimientos por palabras") {
                return Ok(Some(person));
            }
        }

        let frequent = self
            .ledger
            .search_counterparties(side, &[], MOST_FREQUENT)
            .await?;
        let best = best_match(fragment, frequent.iter().map(|c| &c.person))
            .map(|(person, _)| person.clone());
        if let Some(person) = &best {
            debug!("'{fragment}' resuelto por frecuencia como {}", person.name);
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MovementType;
    use crate::testing::{entry, person, LedgerData, MemoryLedger};

    fn resolver(data: LedgerData) -> PersonResolver {
        PersonResolver::new(Arc::new(MemoryLedger::new(data)), 0.3)
    }

    #[test]
    fn score_follows_match_strength() {
        assert_eq!(similarity_score("Agro Sul", "agro sul"), 1.0);
        assert_eq!(similarity_score("Industria", "Indústria Alfa"), 0.95);
        assert_eq!(similarity_score("alfa", "Indústria Alfa"), 0.9);
        assert!((similarity_score("Acme Comercio", "Acme Ltda") - 0.3).abs() < 1e-9);
        assert_eq!(similarity_score("", "Acme"), 0.0);
        assert_eq!(similarity_score("Zeta", "Acme"), 0.0);
    }

    #[test]
    fn self_similarity_is_one_after_normalisation() {
        for name in ["São João", "  Cooperativa  ", "AÇÚCAR E ÁLCOOL"] {
            assert_eq!(similarity_score(name, name), 1.0);
        }
    }

    #[tokio::test]
    async fn direct_match_respects_role() {
        let data = LedgerData {
            persons: vec![
                person(1, "Acme Ltda", Relationship::Client),
                person(2, "Acme Insumos", Relationship::Supplier),
            ],
            ..Default::default()
        };
        let found = resolver(data)
            .resolve(EntityRole::Supplier, "Acme")
            .await
            .unwrap();
        assert_eq!(found.map(|p| p.id), Some(2));
    }

    #[tokio::test]
    async fn tokens_recover_names_with_extra_words() {
        let data = LedgerData {
            persons: vec![person(5, "Agro Sul", Relationship::SupplierClient)],
            ..Default::default()
        };
        let found = resolver(data)
            .resolve(EntityRole::Client, "Agro Sul Comercio Ltda")
            .await
            .unwrap();
        assert_eq!(found.map(|p| p.id), Some(5));
    }

    #[tokio::test]
    async fn falls_back_to_most_frequent_counterparty() {
        let data = LedgerData {
            persons: vec![
                person(1, "Fazenda Boa Vista", Relationship::Payee),
                person(2, "Comercial Norte", Relationship::Payee),
                person(3, "Transportes Leste", Relationship::Supplier),
            ],
            entries: vec![
                entry(1, "2024-01-10", 10.0, MovementType::Outbound, 3, 1),
                entry(2, "2024-01-11", 10.0, MovementType::Outbound, 3, 2),
                entry(3, "2024-01-12", 10.0, MovementType::Outbound, 3, 2),
            ],
            ..Default::default()
        };
        // Nada se parece: gana la contraparte más frecuente.
        let found = resolver(data)
            .resolve(EntityRole::Client, "xyz")
            .await
            .unwrap();
        assert_eq!(found.map(|p| p.id), Some(2));
    }

    #[tokio::test]
    async fn nothing_to_match_yields_none() {
        let found = resolver(LedgerData::default())
            .resolve(EntityRole::Supplier, "Acme")
            .await
            .unwrap();
        assert!(found.is_none());
    }
}

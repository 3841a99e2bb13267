//! Detectores de entidad e intención sobre preguntas en portugués.
//!
//! Cada detector es una función pura sobre el texto. Las reglas son tablas
//! `(palabras clave, etiqueta)` evaluadas en orden: gana la primera que
//! aparece en el texto en minúsculas. Los detectores son independientes y
//! pueden dispararse todos sobre la misma pregunta.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::format::strip_accents;
use crate::models::{MovementType, PaymentStatus};

/// Papel de la contraparte mencionada en la pregunta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRole {
    Supplier,
    Client,
    Payee,
}

impl EntityRole {
    pub fn keyword(&self) -> &'static str {
        match self {
            EntityRole::Supplier => "fornecedor",
            EntityRole::Client => "cliente",
            EntityRole::Payee => "faturado",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Count,
    Average,
    Sum,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DetectedEntity {
    pub role: Option<EntityRole>,
    pub name: Option<String>,
}

/// Ventana temporal detectada; `label` se inserta tal cual en la respuesta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub label: String,
}

/// Todo lo que se pudo detectar en una pregunta.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Intent {
    pub entity: DetectedEntity,
    pub movement_type: Option<MovementType>,
    pub metric: Option<Metric>,
    pub status: Option<PaymentStatus>,
    pub period: Option<Period>,
}

impl Intent {
    pub fn detect(text: &str) -> Self {
        Self {
            entity: detect_entity(text),
            movement_type: detect_movement_type(text),
            metric: detect_metric(text),
            status: detect_status(text),
            period: detect_period(text),
        }
    }

    /// Nombre de contraparte utilizable (rol + al menos dos caracteres).
    pub fn counterparty(&self) -> Option<(EntityRole, &str)> {
        match (self.entity.role, self.entity.name.as_deref()) {
            (Some(role), Some(name)) if name.chars().count() >= 2 => Some((role, name)),
            _ => None,
        }
    }

    /// Hay al menos un filtro o métrica sobre el que responder.
    pub fn is_actionable(&self) -> bool {
        self.counterparty().is_some()
            || self.movement_type.is_some()
            || self.metric.is_some()
            || self.status.is_some()
            || self.period.is_some()
    }
}

type Rule<T> = (&'static [&'static str], T);

const ENTITY_RULES: &[Rule<EntityRole>] = &[
    (&["fornecedor"], EntityRole::Supplier),
    (&["cliente"], EntityRole::Client),
    (&["faturado"], EntityRole::Payee),
];

const MOVEMENT_RULES: &[Rule<MovementType>] = &[
    (&["compra", "compras", "entrada"], MovementType::Inbound),
    (&["venda", "vendas", "saída", "saida"], MovementType::Outbound),
];

const METRIC_RULES: &[Rule<Metric>] = &[
    (
        &["quantas", "quantos", "qtd", "número", "numero", "contagem"],
        Metric::Count,
    ),
    (&["média", "media", "average"], Metric::Average),
    (&["soma", "total", "valor total"], Metric::Sum),
    (
        &["valores", "listar", "quais os valores", "lista"],
        Metric::List,
    ),
];

const STATUS_RULES: &[Rule<PaymentStatus>] = &[
    (
        &["aberta", "abertas", "pendente", "pendentes"],
        PaymentStatus::Pending,
    ),
    (&["paga", "pagas", "pago"], PaymentStatus::Paid),
    (&["vencida", "vencidas", "vencido"], PaymentStatus::Overdue),
    (
        &["cancelada", "canceladas", "cancelado"],
        PaymentStatus::Cancelled,
    ),
];

/// Palabras de pregunta que nunca forman parte de un nombre (sin acentos).
const QUESTION_WORDS: &[&str] = &[
    "a", "o", "as", "os", "um", "uma", "uns", "umas", "de", "do", "da", "dos", "das", "no",
    "na", "nos", "nas", "em", "e", "ou", "que", "com", "sem", "por", "para", "pra", "pelo",
    "pela", "pelos", "pelas", "ao", "aos", "eu", "me", "meu", "minha", "meus", "minhas",
    "nosso", "nossa", "quanto", "quanta", "quantos", "quantas", "qual", "quais", "quando",
    "como", "onde", "foi", "foram", "sao", "ha", "tem", "teve", "tiveram", "possui", "tenho",
    "temos", "mostre", "mostrar", "diga", "informe", "ver", "valor", "valores", "total",
    "totais", "soma", "somar", "media", "nota", "notas", "fiscal", "fiscais", "movimento",
    "movimentos", "conta", "contas", "titulo", "titulos", "vendeu", "venderam", "vendido",
    "vendidos", "vendemos", "comprou", "compraram", "comprado", "comprados", "compramos",
    "gastou", "gastei", "gastamos", "faturou", "faturamento", "recebeu", "recebemos", "pagou",
    "pagamos", "ano", "anos", "mes", "meses", "dia", "dias", "ultimos", "ultimas", "este",
    "esta", "esse", "essa", "passado", "atual", "entre", "ate", "desde", "hoje", "ontem",
    "geral", "todas", "todos", "tudo",
];

/// Ventana máxima de "últimos N dias" (unos cien años).
const MAX_LOOKBACK_DAYS: i64 = 36_500;

const THIS_MONTH: &[&str] = &["este mês", "este mes", "mês atual", "mes atual"];
const LAST_MONTH: &[&str] = &["mês passado", "mes passado"];

static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());
static LAST_DAYS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[uú]ltimos\s+(\d+)\s+dias").unwrap());
static BETWEEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"entre\s+(\d{4}-\d{2}-\d{2})\s+e\s+(\d{4}-\d{2}-\d{2})").unwrap()
});
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").unwrap());

/// Palabras de pregunta más todas las palabras clave de las reglas.
static NON_NAME_WORDS: LazyLock<HashSet<String>> = LazyLock::new(|| {
    fn words<T>(rules: &[Rule<T>]) -> impl Iterator<Item = &'static str> + '_ {
        rules.iter().flat_map(|(keywords, _)| keywords.iter().copied())
    }
    QUESTION_WORDS
        .iter()
        .copied()
        .chain(words(ENTITY_RULES))
        .chain(words(MOVEMENT_RULES))
        .chain(words(METRIC_RULES))
        .chain(words(STATUS_RULES))
        .flat_map(str::split_whitespace)
        .map(strip_accents)
        .collect()
});

fn first_match<T: Copy>(text: &str, rules: &[Rule<T>]) -> Option<T> {
    rules
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| text.contains(k)))
        .map(|(_, tag)| *tag)
}

fn lower(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Primer texto entre comillas dobles.
pub fn extract_quoted(text: &str) -> Option<String> {
    QUOTED
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resto de la línea tras `word` seguido de espacio (sin distinguir mayúsculas).
pub fn extract_after_word(text: &str, word: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?i){}\s+([^\n]+)", regex::escape(word))).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Nombre suelto en una pregunta sin palabra de papel ("quanto a Acme
/// vendeu"): lo que queda tras quitar palabras de pregunta, palabras clave,
/// números y puntuación.
pub fn extract_bare_name(text: &str) -> Option<String> {
    if let Some(quoted) = extract_quoted(text) {
        return Some(quoted);
    }
    let words: Vec<&str> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '/'))
        .filter(|w| !NON_NAME_WORDS.contains(&strip_accents(w)))
        .collect();
    let name = words.join(" ");
    (name.chars().count() >= 2).then_some(name)
}

pub fn detect_entity(text: &str) -> DetectedEntity {
    let t = lower(text);
    match first_match(&t, ENTITY_RULES) {
        Some(role) => DetectedEntity {
            role: Some(role),
            name: extract_quoted(text).or_else(|| extract_after_word(text, role.keyword())),
        },
        None => DetectedEntity::default(),
    }
}

pub fn detect_movement_type(text: &str) -> Option<MovementType> {
    first_match(&lower(text), MOVEMENT_RULES)
}

pub fn detect_metric(text: &str) -> Option<Metric> {
    first_match(&lower(text), METRIC_RULES)
}

pub fn detect_status(text: &str) -> Option<PaymentStatus> {
    first_match(&lower(text), STATUS_RULES)
}

pub fn detect_period(text: &str) -> Option<Period> {
    detect_period_at(text, Local::now().naive_local())
}

/// Igual que [`detect_period`] pero con un "ahora" explícito.
pub fn detect_period_at(text: &str, now: NaiveDateTime) -> Option<Period> {
    let t = lower(text);

    if THIS_MONTH.iter().any(|k| t.contains(k)) {
        let (start, end) = month_bounds(now.year(), now.month())?;
        return Some(Period {
            start: start.and_hms_opt(0, 0, 0)?,
            end: end.and_hms_opt(0, 0, 0)?,
            label: "no mês atual".to_string(),
        });
    }

    if LAST_MONTH.iter().any(|k| t.contains(k)) {
        let (year, month) = if now.month() == 1 {
            (now.year() - 1, 12)
        } else {
            (now.year(), now.month() - 1)
        };
        let (start, end) = month_bounds(year, month)?;
        return Some(Period {
            start: start.and_hms_opt(0, 0, 0)?,
            end: end.and_hms_opt(0, 0, 0)?,
            label: "no mês passado".to_string(),
        });
    }

    if let Some(caps) = LAST_DAYS.captures(&t) {
        let window = caps[1]
            .parse::<i64>()
            .ok()
            .filter(|days| *days <= MAX_LOOKBACK_DAYS)
            .and_then(|days| {
                let start = now.checked_sub_signed(Duration::try_days(days)?)?;
                Some((days, start))
            });
        if let Some((days, start)) = window {
            return Some(Period {
                start,
                end: now,
                label: format!("nos últimos {days} dias"),
            });
        }
    }

    if let Some(caps) = BETWEEN.captures(&t) {
        let start = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d");
        let end = NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d");
        if let (Ok(start), Ok(end)) = (start, end) {
            return Some(Period {
                start: start.and_hms_opt(0, 0, 0)?,
                end: end.and_hms_opt(0, 0, 0)?,
                label: format!("entre {} e {}", &caps[1], &caps[2]),
            });
        }
    }

    if let Some(caps) = YEAR.captures(&t) {
        let year: i32 = caps[1].parse().ok()?;
        return Some(Period {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?.and_hms_opt(0, 0, 0)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?.and_hms_opt(0, 0, 0)?,
            label: format!("em {year}"),
        });
    }

    None
}

fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((start, next.pred_opt()?))
}

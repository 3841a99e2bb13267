//! Extracción de notas fiscales: PDF → texto → JSON estructurado validado.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    config::RetryPolicy,
    error::{AppError, Result},
    format::digits_only,
    llm::{with_retry, LanguageModel, Profile},
};

/// Caracteres del PDF que se envían como máximo al modelo.
pub const MAX_PROMPT_CHARS: usize = 20_000;

const TRUNCATION_MARK: &str = "\n\n[... TEXTO TRUNCADO ...]\n\n";

const EXTRACTION_PREAMBLE: &str =
    "Você é um especialista em análise de notas fiscais brasileiras. Responda APENAS com JSON válido.";

/// Categorías de despesa admitidas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ExpenseCategory {
    #[serde(rename = "INSUMOS_AGRICOLAS")]
    AgriculturalInputs,
    #[serde(rename = "MANUTENCAO_E_OPERACAO")]
    MaintenanceAndOperation,
    #[serde(rename = "RECURSOS_HUMANOS")]
    HumanResources,
    #[serde(rename = "SERVICOS_OPERACIONAIS")]
    OperationalServices,
    #[serde(rename = "INFRAESTRUTURA_E_UTILIDADES")]
    InfrastructureAndUtilities,
    #[serde(rename = "ADMINISTRATIVAS")]
    Administrative,
    #[serde(rename = "SEGUROS_E_PROTECAO")]
    InsuranceAndProtection,
    #[serde(rename = "IMPOSTOS_E_TAXAS")]
    TaxesAndFees,
    #[serde(rename = "INVESTIMENTOS")]
    Investments,
}

impl ExpenseCategory {
    const ALL: [ExpenseCategory; 9] = [
        ExpenseCategory::AgriculturalInputs,
        ExpenseCategory::MaintenanceAndOperation,
        ExpenseCategory::HumanResources,
        ExpenseCategory::OperationalServices,
        ExpenseCategory::InfrastructureAndUtilities,
        ExpenseCategory::Administrative,
        ExpenseCategory::InsuranceAndProtection,
        ExpenseCategory::TaxesAndFees,
        ExpenseCategory::Investments,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            ExpenseCategory::AgriculturalInputs => "INSUMOS_AGRICOLAS",
            ExpenseCategory::MaintenanceAndOperation => "MANUTENCAO_E_OPERACAO",
            ExpenseCategory::HumanResources => "RECURSOS_HUMANOS",
            ExpenseCategory::OperationalServices => "SERVICOS_OPERACIONAIS",
            ExpenseCategory::InfrastructureAndUtilities => "INFRAESTRUTURA_E_UTILIDADES",
            ExpenseCategory::Administrative => "ADMINISTRATIVAS",
            ExpenseCategory::InsuranceAndProtection => "SEGUROS_E_PROTECAO",
            ExpenseCategory::TaxesAndFees => "IMPOSTOS_E_TAXAS",
            ExpenseCategory::Investments => "INVESTIMENTOS",
        }
    }

    /// Ejemplos de lo que entra en cada categoría, para el prompt.
    fn examples(&self) -> &'static str {
        match self {
            ExpenseCategory::AgriculturalInputs => "Sementes, Fertilizantes, Defensivos Agrícolas, Corretivos",
            ExpenseCategory::MaintenanceAndOperation => "Combustíveis, Lubrificantes, Peças, Manutenção de Máquinas, Pneus, Filtros, Ferramentas",
            ExpenseCategory::HumanResources => "Mão de Obra Temporária, Salários e Encargos",
            ExpenseCategory::OperationalServices => "Frete, Transporte, Colheita Terceirizada, Secagem, Armazenagem, Pulverização",
            ExpenseCategory::InfrastructureAndUtilities => "Energia Elétrica, Arrendamento de Terras, Construções, Reformas, Materiais de Construção",
            ExpenseCategory::Administrative => "Honorários Contábeis, Advocatícios, Agronômicos, Despesas Bancárias e Financeiras",
            ExpenseCategory::InsuranceAndProtection => "Seguro Agrícola, Seguro de Ativos, Seguro Prestamista",
            ExpenseCategory::TaxesAndFees => "ITR, IPTU, IPVA, INCRA-CCIR",
            ExpenseCategory::Investments => "Aquisição de Máquinas, Implementos, Veículos, Imóveis, Infraestrutura Rural",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_uppercase();
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InvoiceSupplier {
    #[serde(rename = "razaoSocial")]
    pub legal_name: Option<String>,
    #[serde(rename = "nomeFantasia")]
    pub trade_name: Option<String>,
    pub cnpj: Option<String>,
}

impl InvoiceSupplier {
    pub fn display_name(&self) -> Option<&str> {
        self.legal_name.as_deref().or(self.trade_name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InvoicePayee {
    #[serde(rename = "nomeCompleto")]
    pub full_name: Option<String>,
    pub cpf: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InvoiceInstallment {
    #[serde(rename = "numero")]
    pub number: i32,
    #[serde(rename = "dataVencimento")]
    pub due_date: Option<NaiveDate>,
    #[serde(rename = "valor")]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExpenseShare {
    #[serde(rename = "categoria")]
    pub category: ExpenseCategory,
    #[serde(rename = "subcategoria")]
    pub subcategory: String,
    #[serde(rename = "percentual")]
    pub percentage: f64,
    #[serde(rename = "valor")]
    pub value: f64,
    #[serde(rename = "justificativa")]
    pub rationale: String,
}

/// Datos de una nota fiscal tal como se devuelven al frontend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Invoice {
    #[serde(rename = "fornecedor")]
    pub supplier: InvoiceSupplier,
    #[serde(rename = "faturado")]
    pub payee: InvoicePayee,
    #[serde(rename = "numeroNotaFiscal")]
    pub number: Option<String>,
    #[serde(rename = "dataEmissao")]
    pub issue_date: Option<NaiveDate>,
    #[serde(rename = "descricaoProdutos")]
    pub products: Option<String>,
    #[serde(rename = "parcelas")]
    pub installments: Vec<InvoiceInstallment>,
    #[serde(rename = "valorTotal")]
    pub total_value: f64,
    #[serde(rename = "classificacoesDespesa")]
    pub expenses: Vec<ExpenseShare>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionMetadata {
    pub extracted_at: String,
    pub text_length: usize,
    pub processing_version: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedInvoice {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub metadata: ExtractionMetadata,
}

/// Resultado de comprobar los campos mínimos.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCheck {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Texto del PDF; se ejecuta en un hilo bloqueante.
pub async fn extract_pdf_text(bytes: Vec<u8>) -> Result<String> {
    let size = bytes.len();
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| AppError::Extraction(format!("falha ao processar o PDF: {e}")))?
        .map_err(|e| AppError::Extraction(format!("PDF ilegível: {e}")))?;

    if text.trim().is_empty() {
        return Err(AppError::Extraction(
            "Não foi possível extrair texto do PDF. O arquivo pode estar corrompido ou ser uma imagem."
                .into(),
        ));
    }
    info!("PDF de {size} bytes → {} caracteres de texto", text.chars().count());
    Ok(text)
}

/// Si `text` supera `max` caracteres, conserva el principio y el final.
pub fn truncate_for_prompt(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    warn!("Texto do PDF muito longo ({total} caracteres), truncando para {max}");
    let half = max / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(total - half).collect();
    format!("{head}{TRUNCATION_MARK}{tail}")
}

fn schema_json() -> String {
    serde_json::to_string_pretty(&schemars::schema_for!(Invoice)).unwrap_or_default()
}

pub fn invoice_prompt(pdf_text: &str) -> String {
    let categories = ExpenseCategory::ALL
        .iter()
        .map(|c| format!("- {}: {}", c.code(), c.examples()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Analise o texto da nota fiscal abaixo e extraia TODOS os dados solicitados em formato JSON.

**TEXTO DA NOTA FISCAL:**
{pdf_text}

**INSTRUÇÕES IMPORTANTES:**
1. Retorne APENAS um JSON válido, sem texto adicional
2. Se algum campo não for encontrado, use null
3. Para datas, use formato YYYY-MM-DD
4. Para valores monetários, use números decimais (ex: 1250.75)
5. Para CNPJ/CPF, mantenha a formatação original se houver
6. Classifique a DESPESA baseada nos produtos/serviços descritos; com vários tipos de produto, \
crie várias classificações cujos percentuais somem 100

**CATEGORIAS DE DESPESAS DISPONÍVEIS:**
{categories}

**JSON SCHEMA DO RESULTADO:**
{schema}
",
        schema = schema_json()
    )
}

fn reprocessing_prompt(pdf_text: &str, error: &str) -> String {
    format!(
        "Houve um erro no processamento anterior: {error}

Por favor, analise novamente o texto da nota fiscal e retorne um JSON válido e completo, \
com todos os campos obrigatórios.

**TEXTO DA NOTA FISCAL:**
{pdf_text}

Retorne APENAS o JSON válido, sem texto adicional:
"
    )
}

/// El objeto JSON entre la primera `{` y la última `}` de la respuesta.
pub fn extract_json(raw: &str) -> std::result::Result<Value, String> {
    let candidate = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => raw.trim(),
    };
    serde_json::from_str(candidate).map_err(|e| e.to_string())
}

fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Acepta números y cadenas como "1250.75" o "1.250,75".
fn number_field(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim().trim_start_matches("R$").trim();
            let normalized = if s.contains(',') {
                s.replace('.', "").replace(',', ".")
            } else {
                s.to_string()
            };
            normalized.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn date_field(object: &Map<String, Value>, key: &str) -> Option<NaiveDate> {
    let raw = text_field(object, key)?;
    let parsed = (raw.len() == 10)
        .then(|| NaiveDate::parse_from_str(&raw, "%Y-%m-%d").ok())
        .flatten();
    if parsed.is_none() {
        warn!("Data inválida em {key}: {raw}");
    }
    parsed
}

fn object_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    object.get(key).and_then(Value::as_object)
}

fn normalize_installments(raw: Option<&Value>, total: f64) -> Vec<InvoiceInstallment> {
    let items = raw.and_then(Value::as_array).filter(|a| !a.is_empty());
    let Some(items) = items else {
        return vec![InvoiceInstallment {
            number: 1,
            due_date: None,
            value: total,
        }];
    };

    let installments: Vec<InvoiceInstallment> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let empty = Map::new();
            let object = item.as_object().unwrap_or(&empty);
            InvoiceInstallment {
                number: number_field(object.get("numero"))
                    .map(|n| n as i32)
                    .filter(|n| *n > 0)
                    .unwrap_or(i as i32 + 1),
                due_date: date_field(object, "dataVencimento"),
                value: number_field(object.get("valor")).unwrap_or(0.0),
            }
        })
        .collect();

    let sum: f64 = installments.iter().map(|p| p.value).sum();
    if total > 0.0 && (sum - total).abs() > 0.01 {
        warn!("Soma das parcelas ({sum}) difere do valor total ({total})");
    }
    installments
}

fn normalize_expenses(raw: Option<&Value>, total: f64) -> Vec<ExpenseShare> {
    let items = raw.and_then(Value::as_array).filter(|a| !a.is_empty());
    let Some(items) = items else {
        return vec![ExpenseShare {
            category: ExpenseCategory::Administrative,
            subcategory: "Não classificado".into(),
            percentage: 100.0,
            value: total,
            rationale: "Classificação automática - dados insuficientes".into(),
        }];
    };

    let mut shares: Vec<ExpenseShare> = items
        .iter()
        .map(|item| {
            let empty = Map::new();
            let object = item.as_object().unwrap_or(&empty);
            let raw_category = text_field(object, "categoria");
            let category = raw_category
                .as_deref()
                .and_then(ExpenseCategory::parse)
                .unwrap_or_else(|| {
                    warn!("Categoria inválida: {raw_category:?}");
                    ExpenseCategory::Administrative
                });
            let percentage = number_field(object.get("percentual"))
                .map(|p| p.clamp(0.0, 100.0))
                .unwrap_or(0.0);
            let value = number_field(object.get("valor"))
                .unwrap_or_else(|| total * percentage / 100.0);
            ExpenseShare {
                category,
                subcategory: text_field(object, "subcategoria")
                    .unwrap_or_else(|| "Não especificado".into()),
                percentage,
                value,
                rationale: text_field(object, "justificativa")
                    .unwrap_or_else(|| "Sem justificativa".into()),
            }
        })
        .collect();

    let sum: f64 = shares.iter().map(|s| s.percentage).sum();
    if (sum - 100.0).abs() > 0.01 && sum > 0.0 {
        warn!("Soma dos percentuais ({sum}%) não é 100%; ajustando proporcionalmente");
        for share in &mut shares {
            share.percentage = share.percentage / sum * 100.0;
            if total > 0.0 {
                share.value = total * share.percentage / 100.0;
            }
        }
    }
    shares
}

/// Estructura y corrige la salida del modelo.
pub fn normalize_invoice(raw: &Value) -> Result<Invoice> {
    let object = raw
        .as_object()
        .ok_or_else(|| AppError::Extraction("Dados extraídos inválidos ou vazios".into()))?;

    let total_value = number_field(object.get("valorTotal")).unwrap_or_else(|| {
        warn!("Valor total não encontrado ou inválido");
        0.0
    });

    let supplier = object_field(object, "fornecedor")
        .map(|s| InvoiceSupplier {
            legal_name: text_field(s, "razaoSocial"),
            trade_name: text_field(s, "nomeFantasia"),
            cnpj: text_field(s, "cnpj"),
        })
        .unwrap_or_default();
    let payee = object_field(object, "faturado")
        .map(|p| InvoicePayee {
            full_name: text_field(p, "nomeCompleto"),
            cpf: text_field(p, "cpf"),
        })
        .unwrap_or_default();

    Ok(Invoice {
        supplier,
        payee,
        number: text_field(object, "numeroNotaFiscal"),
        issue_date: date_field(object, "dataEmissao"),
        products: text_field(object, "descricaoProdutos"),
        installments: normalize_installments(object.get("parcelas"), total_value),
        total_value,
        expenses: normalize_expenses(object.get("classificacoesDespesa"), total_value),
    })
}

pub fn check_required_fields(invoice: &Invoice) -> FieldCheck {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if invoice.supplier.display_name().is_none() {
        errors.push("Nome do fornecedor (Razão Social ou Fantasia) é obrigatório".to_string());
    }
    if invoice.number.is_none() {
        errors.push("Número da nota fiscal é obrigatório".to_string());
    }
    if invoice.total_value <= 0.0 {
        errors.push("Valor total deve ser maior que zero".to_string());
    }

    if invoice.issue_date.is_none() {
        warnings.push("Data de emissão não encontrada".to_string());
    }
    match invoice.supplier.cnpj.as_deref() {
        None => warnings.push("CNPJ do fornecedor não encontrado".to_string()),
        Some(cnpj) if digits_only(cnpj).len() != 14 => {
            warnings.push(format!("CNPJ do fornecedor com formato inválido: {cnpj}"))
        }
        _ => {}
    }
    if let Some(cpf) = invoice.payee.cpf.as_deref() {
        if digits_only(cpf).len() != 11 {
            warnings.push(format!("CPF do faturado com formato inválido: {cpf}"));
        }
    }
    if invoice.products.is_none() {
        warnings.push("Descrição dos produtos não encontrada".to_string());
    }

    FieldCheck {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

pub struct InvoiceExtractor {
    llm: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl InvoiceExtractor {
    pub fn new(llm: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub async fn extract(&self, pdf: Vec<u8>) -> Result<ExtractedInvoice> {
        let text = extract_pdf_text(pdf).await?;
        self.extract_from_text(&text).await
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        let reply = with_retry(&self.retry, "Extração de nota fiscal", || {
            self.llm
                .complete(EXTRACTION_PREAMBLE, prompt, Profile::Extraction)
        })
        .await?;
        Ok(reply)
    }

    /// Texto → JSON del modelo (con un reintento de reformateo) → nota validada.
    pub async fn extract_from_text(&self, text: &str) -> Result<ExtractedInvoice> {
        let text_length = text.chars().count();
        let prompt_text = truncate_for_prompt(text, MAX_PROMPT_CHARS);

        let reply = self.ask(&invoice_prompt(&prompt_text)).await?;
        let raw = match extract_json(&reply) {
            Ok(raw) => raw,
            Err(reason) => {
                warn!("Resposta do modelo sem JSON válido ({reason}); reprocessando");
                let reply = self
                    .ask(&reprocessing_prompt(&prompt_text, &reason))
                    .await?;
                extract_json(&reply).map_err(|e| {
                    AppError::Extraction(format!(
                        "Resposta do modelo não está em formato JSON válido: {e}"
                    ))
                })?
            }
        };

        let invoice = normalize_invoice(&raw)?;
        info!(
            "Nota {:?} extraída: total {} em {} parcela(s)",
            invoice.number,
            invoice.total_value,
            invoice.installments.len()
        );
        Ok(ExtractedInvoice {
            invoice,
            metadata: ExtractionMetadata {
                extracted_at: Utc::now().to_rfc3339(),
                text_length,
                processing_version: env!("CARGO_PKG_VERSION"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::testing::ScriptedLlm;
    use serde_json::json;

    #[test]
    fn truncation_keeps_both_ends() {
        let text = format!("{}{}", "a".repeat(20), "b".repeat(20));
        assert_eq!(
            truncate_for_prompt(&text, 10),
            format!("aaaaa{TRUNCATION_MARK}bbbbb")
        );
        assert_eq!(truncate_for_prompt("curto", 10), "curto");
    }

    #[test]
    fn finds_json_inside_prose() {
        let value = extract_json("Segue o resultado: {\"valorTotal\": 10} obrigado").unwrap();
        assert_eq!(value["valorTotal"], json!(10));
        assert!(extract_json("sem json").is_err());
    }

    #[test]
    fn missing_parts_get_defaults() {
        let invoice = normalize_invoice(&json!({
            "fornecedor": {"razaoSocial": "Agro Sul Ltda", "cnpj": "12.345.678/0001-90"},
            "numeroNotaFiscal": 4512,
            "dataEmissao": "2024-13-40",
            "valorTotal": "1.250,75"
        }))
        .unwrap();

        assert_eq!(invoice.number.as_deref(), Some("4512"));
        assert_eq!(invoice.issue_date, None);
        assert_eq!(invoice.total_value, 1250.75);
        assert_eq!(
            invoice.installments,
            vec![InvoiceInstallment {
                number: 1,
                due_date: None,
                value: 1250.75
            }]
        );
        assert_eq!(invoice.expenses.len(), 1);
        assert_eq!(invoice.expenses[0].category, ExpenseCategory::Administrative);
        assert_eq!(invoice.expenses[0].subcategory, "Não classificado");
        assert_eq!(invoice.expenses[0].percentage, 100.0);
    }

    #[test]
    fn percentages_are_clamped_and_rescaled() {
        let invoice = normalize_invoice(&json!({
            "valorTotal": 1200.0,
            "classificacoesDespesa": [
                {"categoria": "INSUMOS_AGRICOLAS", "subcategoria": "Sementes", "percentual": 150},
                {"categoria": "OUTRA", "percentual": 100, "valor": 5}
            ]
        }))
        .unwrap();

        let shares = &invoice.expenses;
        assert_eq!(shares[0].category, ExpenseCategory::AgriculturalInputs);
        assert_eq!(shares[1].category, ExpenseCategory::Administrative);
        assert!((shares[0].percentage - 50.0).abs() < 1e-9);
        assert!((shares[1].percentage - 50.0).abs() < 1e-9);
        assert!((shares[0].value - 600.0).abs() < 1e-9);
        assert!((shares[1].value - 600.0).abs() < 1e-9);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(matches!(
            normalize_invoice(&json!([1, 2])),
            Err(AppError::Extraction(_))
        ));
    }

    #[test]
    fn required_fields_report_errors_and_warnings() {
        let check = check_required_fields(&Invoice {
            payee: InvoicePayee {
                full_name: Some("João".into()),
                cpf: Some("123".into()),
            },
            ..Default::default()
        });
        assert!(!check.is_valid);
        assert_eq!(check.errors.len(), 3);
        assert!(check.warnings.iter().any(|w| w.contains("CPF")));
        assert!(check.warnings.iter().any(|w| w.contains("CNPJ")));
    }

    #[test]
    fn prompt_embeds_schema_and_categories() {
        let prompt = invoice_prompt("NF 123");
        assert!(prompt.contains("NF 123"));
        assert!(prompt.contains("numeroNotaFiscal"));
        assert!(prompt.contains("INSUMOS_AGRICOLAS"));
    }

    fn extractor(llm: Arc<ScriptedLlm>) -> InvoiceExtractor {
        InvoiceExtractor::new(llm, RetryPolicy::default())
    }

    #[tokio::test]
    async fn malformed_reply_triggers_one_reprocessing() {
        let llm = Arc::new(ScriptedLlm::replying(vec![
            Ok("não consegui".into()),
            Ok("```json\n{\"numeroNotaFiscal\": \"77\", \"valorTotal\": 50}\n```".into()),
        ]));
        let extracted = extractor(llm.clone())
            .extract_from_text("Nota fiscal 77")
            .await
            .unwrap();

        assert_eq!(extracted.invoice.number.as_deref(), Some("77"));
        assert_eq!(extracted.metadata.text_length, 14);
        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].1.starts_with("Houve um erro no processamento anterior"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let llm = Arc::new(ScriptedLlm::replying(vec![
            Err(LlmError::classify("503 overloaded")),
            Ok("{\"valorTotal\": 10}".into()),
        ]));
        let extracted = extractor(llm.clone()).extract_from_text("x").await.unwrap();
        assert_eq!(extracted.invoice.total_value, 10.0);
        assert_eq!(llm.prompts().len(), 2);
    }

    #[tokio::test]
    async fn second_malformed_reply_is_an_extraction_error() {
        let llm = Arc::new(ScriptedLlm::replying(vec![Ok("nada".into()), Ok("ainda nada".into())]));
        let err = extractor(llm).extract_from_text("x").await.unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));
    }
}

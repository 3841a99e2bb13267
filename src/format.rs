//! Formato de moneda (BRL) y fechas en pt-BR, y normalización de texto.

use chrono::NaiveDate;
use unicode_normalization::UnicodeNormalization;

/// Formatea un valor como moneda brasileña: `R$ 1.234,56`.
pub fn format_brl(value: f64) -> String {
    let value = if value.is_finite() { value } else { 0.0 };
    let cents = (value.abs() * 100.0).round() as u64;
    let integer = (cents / 100).to_string();
    let fraction = cents % 100;

    let mut grouped = String::with_capacity(integer.len() + integer.len() / 3);
    for (i, ch) in integer.chars().enumerate() {
        if i > 0 && (integer.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}R$ {grouped},{fraction:02}")
}

/// `dd/mm/aaaa`.
pub fn format_date_br(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Quita acentos (NFD sin marcas combinantes), pasa a minúsculas y recorta.
pub fn strip_accents(text: &str) -> String {
    text.trim()
        .nfd()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .collect::<String>()
        .to_lowercase()
}

/// Sólo los dígitos de un CPF/CNPJ.
pub fn digits_only(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Colapsa espacios repetidos, como hacen las plantillas de respuesta.
pub fn squash_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brl_uses_dot_thousands_and_comma_decimals() {
        assert_eq!(format_brl(300.0), "R$ 300,00");
        assert_eq!(format_brl(1234.5), "R$ 1.234,50");
        assert_eq!(format_brl(1_000_000.0), "R$ 1.000.000,00");
        assert_eq!(format_brl(0.0), "R$ 0,00");
        assert_eq!(format_brl(-10.0), "-R$ 10,00");
    }

    #[test]
    fn strips_portuguese_accents() {
        assert_eq!(strip_accents("  Indústria São João "), "industria sao joao");
        assert_eq!(strip_accents("AÇÚCAR"), "acucar");
    }

    #[test]
    fn date_and_digits_helpers() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(format_date_br(date), "05/03/2024");
        assert_eq!(digits_only("12.345.678/0001-90"), "12345678000190");
        assert_eq!(squash_spaces("Total  de   compra"), "Total de compra");
    }
}

//! Bank account details from Brazilian agreement forms ("convênios").

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;

use super::{ExtractionRecord, RecordExtractor, RecordOrigin};
use crate::prelude::*;

/// Words that suggest a page has bank details on it.
const KEYWORDS: &[&str] = &[
    "CONVÊNIO",
    "CONVENIO",
    "BANCO",
    "DADOS BANCÁRIOS",
    "DADOS BANCARIOS",
    "AGÊNCIA",
    "AGENCIA",
    "CONTA",
    "CONTA CORRENTE",
    "CONTA POUPANÇA",
    "POUPANCA",
    "CPF",
    "CNPJ",
    "INSTITUIÇÃO FINANCEIRA",
    "INSTITUICAO FINANCEIRA",
    "BANCO DO BRASIL",
    "BRADESCO",
    "ITAU",
    "SANTANDER",
    "CAIXA",
    "CAIXA ECONOMICA",
    "NUBANK",
    "INTER",
];

/// Any one of these is enough on its own.
const HIGH_PRIORITY_KEYWORDS: &[&str] =
    &["CONVÊNIO", "CONVENIO", "DADOS BANCÁRIOS", "DADOS BANCARIOS"];

/// Pages need this many ordinary keywords to count as relevant.
const MIN_KEYWORDS: usize = 2;

/// Known banks. Longer names come first so they win over their abbreviations.
const KNOWN_BANKS: &[&str] = &[
    "BANCO DO ESTADO DO RIO GRANDE DO SUL",
    "CAIXA ECONOMICA FEDERAL",
    "BANCO COOPERATIVO SICOOB",
    "BANCO DO BRASIL",
    "ITAU UNIBANCO",
    "BANCO SANTANDER",
    "NU PAGAMENTOS",
    "BANCO INTER",
    "BANCO SICREDI",
    "BANCO BRASIL",
    "BRADESCO",
    "SANTANDER",
    "BANRISUL",
    "NUBANK",
    "SICREDI",
    "SICOOB",
    "CAIXA",
    "ITAU",
    "INTER",
    "CEF",
    "BB",
];

static KNOWN_BANK_REGEXES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    KNOWN_BANKS
        .iter()
        .map(|&bank| {
            let re = Regex::new(&format!(r"\b{}\b", regex::escape(bank)))
                .expect("failed to compile regex");
            (bank, re)
        })
        .collect()
});

static GENERIC_BANK_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"BANCO\s+([A-ZÁÉÍÓÚÇ]+(?:\s+[A-ZÁÉÍÓÚÇ]+)*)",
        r"INSTITUI[ÇC][AÃ]O\s+FINANCEIRA\s+([A-ZÁÉÍÓÚÇ]+(?:\s+[A-ZÁÉÍÓÚÇ]+)*)",
    ]
    .iter()
    .map(|re| Regex::new(re).expect("failed to compile regex"))
    .collect()
});

static AGENCY_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)AG[EÊ]NCIA[:\s]+(\d{4,5})",
        r"(?i)AG[EÊ]NCIA[:\s]+(\d{1,2}\.\d{3})",
        r"(?i)\bAG[:\s]+(\d{4,5})",
        r"(?i)\bAG[:\s]+(\d{1,2}\.\d{3})",
    ]
    .iter()
    .map(|re| Regex::new(re).expect("failed to compile regex"))
    .collect()
});

static ACCOUNT_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)CONTA[:\s]+(\d{5,10})",
        r"(?i)CONTA[:\s]+(\d{1,5}[-.]?\d{1,5})",
        r"(?i)CONTA\s+CORRENTE[:\s]+(\d{1,5}[-.]?\d{1,5})",
        r"(?i)CONTA\s+POUPAN[ÇC]A[:\s]+(\d{1,5}[-.]?\d{1,5})",
        r"(?i)\bCC[:\s]+(\d{5,10})",
    ]
    .iter()
    .map(|re| Regex::new(re).expect("failed to compile regex"))
    .collect()
});

static CNPJ_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}").expect("failed to compile regex")
});

static CPF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{3}\.?\d{3}\.?\d{3}-?\d{2}").expect("failed to compile regex")
});

static AMOUNT_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"R\$\s*(\d{1,3}(?:\.\d{3})*(?:,\d{2})?)",
        r"(\d{1,3}(?:\.\d{3})*(?:,\d{2})?)\s*R\$",
    ]
    .iter()
    .map(|re| Regex::new(re).expect("failed to compile regex"))
    .collect()
});

/// Keyword page filter and regex field extractor for bank details.
///
/// Each relevant page yields at most one record, with whichever of `bank`,
/// `agency`, `account`, `account_type`, `tax_id` and `amount` could be found.
/// A page only produces a record if it names a bank or has both an agency and
/// an account.
#[derive(Debug, Default)]
pub struct BankDetailsExtractor;

impl BankDetailsExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl RecordExtractor for BankDetailsExtractor {
    fn is_relevant(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let upper = text.to_uppercase();
        HIGH_PRIORITY_KEYWORDS.iter().any(|kw| upper.contains(kw))
            || KEYWORDS.iter().filter(|kw| upper.contains(*kw)).count() >= MIN_KEYWORDS
    }

    fn extract(&self, origin: &RecordOrigin, text: &str) -> Vec<ExtractionRecord> {
        let upper = text.to_uppercase();
        let bank = extract_bank(&upper);
        let agency = extract_agency(text);
        let account = extract_account(text);
        if bank.is_none() && (agency.is_none() || account.is_none()) {
            trace!(document = %origin.document, page = origin.page, "No bank details on page");
            return vec![];
        }

        let mut record = ExtractionRecord::new(origin);
        let mut set = |name: &str, value: Option<Value>| {
            if let Some(value) = value {
                record.fields.insert(name.to_owned(), value);
            }
        };
        set("bank", bank.map(Value::from));
        set("agency", agency.map(Value::from));
        set("account", account.map(Value::from));
        set("account_type", extract_account_type(&upper).map(Value::from));
        set("tax_id", extract_tax_id(text).map(Value::from));
        set("amount", extract_amount(text).map(Value::from));
        vec![record]
    }

    /// Drop records that repeat an agency and account we've already seen.
    fn finalize(&self, records: Vec<ExtractionRecord>) -> Vec<ExtractionRecord> {
        let mut seen = HashSet::new();
        records
            .into_iter()
            .filter(|record| {
                let agency = record.field_str("agency");
                let account = record.field_str("account");
                if agency.is_none() && account.is_none() {
                    return true;
                }
                seen.insert((
                    agency.unwrap_or_default().to_owned(),
                    account.unwrap_or_default().to_owned(),
                ))
            })
            .collect()
    }
}

fn extract_bank(upper: &str) -> Option<String> {
    if let Some((bank, _)) = KNOWN_BANK_REGEXES.iter().find(|(_, re)| re.is_match(upper)) {
        return Some((*bank).to_owned());
    }
    GENERIC_BANK_REGEXES
        .iter()
        .filter_map(|re| re.captures(upper))
        .map(|caps| caps[1].trim().to_owned())
        .find(|name| name.chars().count() > 3)
}

fn extract_agency(text: &str) -> Option<String> {
    AGENCY_REGEXES
        .iter()
        .filter_map(|re| re.captures(text))
        .map(|caps| caps[1].replace('.', ""))
        .find(|agency| agency.len() >= 4)
}

fn extract_account(text: &str) -> Option<String> {
    ACCOUNT_REGEXES
        .iter()
        .filter_map(|re| re.captures(text))
        .map(|caps| caps[1].replace(['.', '-'], ""))
        .find(|account| account.len() >= 5)
}

fn extract_account_type(upper: &str) -> Option<&'static str> {
    if upper.contains("POUPANÇA") || upper.contains("POUPANCA") {
        Some("savings")
    } else if upper.contains("CORRENTE") {
        Some("checking")
    } else {
        None
    }
}

/// A CNPJ (company) or CPF (person) number, normalized to its usual format.
fn extract_tax_id(text: &str) -> Option<String> {
    let digits_of = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
    if let Some(m) = CNPJ_REGEX.find(text) {
        let d = digits_of(m.as_str());
        if d.len() == 14 {
            return Some(format!(
                "{}.{}.{}/{}-{}",
                &d[..2],
                &d[2..5],
                &d[5..8],
                &d[8..12],
                &d[12..]
            ));
        }
    }
    if let Some(m) = CPF_REGEX.find(text) {
        let d = digits_of(m.as_str());
        if d.len() == 11 {
            return Some(format!("{}.{}.{}-{}", &d[..3], &d[3..6], &d[6..9], &d[9..]));
        }
    }
    None
}

/// The largest amount in reais on the page, which is usually the total.
fn extract_amount(text: &str) -> Option<f64> {
    AMOUNT_REGEXES.iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|caps| caps[1].replace('.', "").replace(',', ".").parse::<f64>().ok())
            .reduce(f64::max)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "DADOS BANCÁRIOS\n\
        Banco: Banco do Brasil\n\
        Agência: 1234\n\
        Conta Corrente: 98765-4\n\
        CPF: 123.456.789-09\n\
        Valor: R$ 1.234,56 (total R$ 99,00)\n";

    fn origin(page: usize) -> RecordOrigin {
        RecordOrigin {
            document: "convenio.pdf".to_owned(),
            page,
        }
    }

    #[test]
    fn relevance_needs_a_strong_keyword_or_two_weak_ones() {
        let extractor = BankDetailsExtractor::new();
        assert!(extractor.is_relevant("Termo de Convênio nº 42"));
        assert!(extractor.is_relevant("banco e conta"));
        assert!(!extractor.is_relevant("Conta de luz"));
        assert!(!extractor.is_relevant("   \n"));
    }

    #[test]
    fn extracts_all_fields_from_a_page() {
        let extractor = BankDetailsExtractor::new();
        let records = extractor.extract(&origin(3), PAGE);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.document, "convenio.pdf");
        assert_eq!(record.page, 3);
        assert_eq!(record.field_str("bank"), Some("BANCO DO BRASIL"));
        assert_eq!(record.field_str("agency"), Some("1234"));
        assert_eq!(record.field_str("account"), Some("987654"));
        assert_eq!(record.field_str("account_type"), Some("checking"));
        assert_eq!(record.field_str("tax_id"), Some("123.456.789-09"));
        assert_eq!(record.fields.get("amount"), Some(&Value::from(1234.56)));
    }

    #[test]
    fn pages_without_bank_or_account_yield_nothing() {
        let extractor = BankDetailsExtractor::new();
        let records = extractor.extract(&origin(1), "CONVÊNIO\nAgência: 1234\n");
        assert!(records.is_empty());
    }

    #[test]
    fn short_bank_abbreviations_need_word_boundaries() {
        assert_eq!(extract_bank("INTERNACIONAL ABBA"), None);
        assert_eq!(extract_bank("PAGAR NO BB").as_deref(), Some("BB"));
    }

    #[test]
    fn finalize_drops_repeated_accounts() {
        let extractor = BankDetailsExtractor::new();
        let mut records = extractor.extract(&origin(1), PAGE);
        records.extend(extractor.extract(&origin(2), PAGE));
        records.extend(extractor.extract(&origin(5), "Banco Bradesco"));
        records.extend(extractor.extract(&origin(6), "Banco Bradesco"));
        let kept = extractor.finalize(records);
        let pages = kept.iter().map(|r| r.page).collect::<Vec<_>>();
        assert_eq!(pages, vec![1, 5, 6]);
    }

    #[test]
    fn formats_cnpj_numbers() {
        assert_eq!(
            extract_tax_id("CNPJ 12345678000190").as_deref(),
            Some("12.345.678/0001-90")
        );
    }
}

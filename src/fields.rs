//! Document classification and field parsing from OCR text.
//!
//! Pure functions, no async. Profiles are compiled once per request; invalid
//! patterns are skipped with a warning rather than failing the upload.

use regex::Regex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::config::{DocumentProfile, ValueType};
use crate::schema::DocumentKind;

/// Money capture group: `$1,234.56`, `1234`, `(1,234.56)`, `-12.50`.
const AMOUNT_PATTERN: &str = r"(\(?-?\$?\s?[0-9][0-9,]*(?:\.[0-9]{1,2})?\)?)";
const STATE_PATTERN: &str = r"([A-Z]{2})";

const FORM_PATTERN_WEIGHT: u32 = 5;
const KEYWORD_WEIGHT: u32 = 1;

/// A profile with its regexes compiled.
pub struct CompiledProfile {
    pub kind: DocumentKind,
    form_patterns: Vec<Regex>,
    keywords: Vec<String>,
    fields: Vec<CompiledField>,
    required: Vec<String>,
}

struct CompiledField {
    field: String,
    value_type: ValueType,
    patterns: Vec<Regex>,
}

/// Values parsed from one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFields {
    pub amounts: BTreeMap<String, Decimal>,
    pub attributes: BTreeMap<String, String>,
    pub missing_required: Vec<String>,
}

impl ParsedFields {
    /// Fraction of required fields found (1.0 when nothing is required).
    pub fn completeness(&self, required_count: usize) -> f64 {
        if required_count == 0 {
            return 1.0;
        }
        let found = required_count.saturating_sub(self.missing_required.len());
        found as f64 / required_count as f64
    }

    pub fn contains(&self, field: &str) -> bool {
        self.amounts.contains_key(field) || self.attributes.contains_key(field)
    }
}

impl CompiledProfile {
    pub fn compile(profile: &DocumentProfile) -> Self {
        let form_patterns = profile
            .form_patterns
            .iter()
            .filter_map(|p| compile_pattern(&profile.kind, "form", p))
            .collect();

        let fields = profile
            .fields
            .iter()
            .map(|f| CompiledField {
                field: f.field.clone(),
                value_type: f.value_type,
                patterns: f
                    .patterns
                    .iter()
                    .filter_map(|p| compile_pattern(&profile.kind, &f.field, p))
                    .collect(),
            })
            .collect();

        Self {
            kind: profile.kind,
            form_patterns,
            keywords: profile.keywords.iter().map(|k| k.to_lowercase()).collect(),
            fields,
            required: profile.required.clone(),
        }
    }

    /// Weighted count of form-identifier and keyword hits.
    pub fn score(&self, text: &str) -> u32 {
        let lowered = text.to_lowercase();
        let form_hits = self.form_patterns.iter().filter(|re| re.is_match(text)).count() as u32;
        let keyword_hits = self
            .keywords
            .iter()
            .filter(|k| lowered.contains(k.as_str()))
            .count() as u32;
        form_hits * FORM_PATTERN_WEIGHT + keyword_hits * KEYWORD_WEIGHT
    }
}

fn compile_pattern(kind: &DocumentKind, field: &str, pattern: &str) -> Option<Regex> {
    let expanded = pattern
        .replace("{amount}", AMOUNT_PATTERN)
        .replace("{state}", STATE_PATTERN);
    match Regex::new(&expanded) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(
                "Skipping invalid pattern for {} field '{}' ({}): {}",
                kind, field, pattern, e
            );
            None
        }
    }
}

/// Compile every profile.
pub fn compile_all(profiles: &[DocumentProfile]) -> Vec<CompiledProfile> {
    let compiled: Vec<CompiledProfile> = profiles.iter().map(CompiledProfile::compile).collect();
    debug!("Compiled {} document profiles", compiled.len());
    compiled
}

/// Pick the best-scoring kind. Zero scores and ties are `Unknown`.
pub fn classify(text: &str, profiles: &[CompiledProfile]) -> DocumentKind {
    let mut scores: Vec<(DocumentKind, u32)> = profiles
        .iter()
        .map(|p| (p.kind, p.score(text)))
        .filter(|(_, score)| *score > 0)
        .collect();
    scores.sort_by(|a, b| b.1.cmp(&a.1));

    debug!("Classification scores: {:?}", scores);

    match scores.as_slice() {
        [] => DocumentKind::Unknown,
        [(kind, _)] => *kind,
        [(kind, best), (_, second), ..] if best > second => *kind,
        _ => DocumentKind::Unknown,
    }
}

/// Run a profile's field patterns over the text. First matching pattern wins.
pub fn parse_fields(text: &str, profile: &CompiledProfile) -> ParsedFields {
    let mut parsed = ParsedFields::default();

    for field in &profile.fields {
        let value = field.patterns.iter().find_map(|re| {
            re.captures_iter(text).find_map(|cap| {
                let raw = cap.get(1).or_else(|| cap.get(0))?.as_str();
                normalize_value(raw, field.value_type)
            })
        });

        match value {
            Some(FieldValue::Amount(amount)) => {
                parsed.amounts.insert(field.field.clone(), amount);
            }
            Some(FieldValue::Text(text)) => {
                parsed.attributes.insert(field.field.clone(), text);
            }
            None => {}
        }
    }

    parsed.missing_required = profile
        .required
        .iter()
        .filter(|f| !parsed.contains(f))
        .cloned()
        .collect();

    parsed
}

enum FieldValue {
    Amount(Decimal),
    Text(String),
}

fn normalize_value(raw: &str, value_type: ValueType) -> Option<FieldValue> {
    match value_type {
        ValueType::Amount => parse_amount(raw).map(FieldValue::Amount),
        ValueType::State => {
            let code = raw.trim().to_ascii_uppercase();
            if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                Some(FieldValue::Text(code))
            } else {
                None
            }
        }
        ValueType::Text => {
            let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            if cleaned.is_empty() {
                None
            } else {
                Some(FieldValue::Text(cleaned))
            }
        }
    }
}

/// Parse a money string as printed on tax forms.
///
/// Accepts currency signs, thousands separators and accounting-style
/// parentheses for negatives. Returns `None` for blanks and garbage.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    let negative = (trimmed.starts_with('(') && trimmed.ends_with(')')) || trimmed.starts_with('-');

    let digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() || digits == "." {
        return None;
    }

    let value = Decimal::from_str(&digits).ok()?;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldPattern, ProfileStore};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    const W2_TEXT: &str = "\
Form W-2 Wage and Tax Statement 2024
Employer's name: Acme Widgets Inc
b Employer identification number 12-3456789
1 Wages, tips, other compensation $50,000.00
2 Federal income tax withheld $6,000.00
3 Social security wages 52,000.00
5 Medicare wages and tips 52,000.00
15 State: MA
16 State wages, tips, etc. 50,000.00
17 State income tax 2,450.00
";

    const INT_TEXT: &str = "\
1099-INT Interest Income
Payer's name: First Bank
1 Interest income 412.37
4 Federal income tax withheld 0.00
";

    fn compiled() -> Vec<CompiledProfile> {
        compile_all(&ProfileStore::builtin().unwrap().all())
    }

    fn profile_for(kind: DocumentKind) -> CompiledProfile {
        CompiledProfile::compile(&ProfileStore::builtin().unwrap().get(kind).unwrap())
    }

    #[test]
    fn test_classify_w2() {
        assert_eq!(classify(W2_TEXT, &compiled()), DocumentKind::W2);
    }

    #[test]
    fn test_classify_1099_int() {
        assert_eq!(classify(INT_TEXT, &compiled()), DocumentKind::Form1099Int);
    }

    #[test]
    fn test_classify_unrelated_text_is_unknown() {
        assert_eq!(
            classify("Dear customer, your order has shipped.", &compiled()),
            DocumentKind::Unknown
        );
    }

    #[test]
    fn test_parse_w2_fields() {
        let parsed = parse_fields(W2_TEXT, &profile_for(DocumentKind::W2));

        assert_eq!(parsed.amounts.get("wages"), Some(&dec!(50000.00)));
        assert_eq!(parsed.amounts.get("federal_withheld"), Some(&dec!(6000.00)));
        assert_eq!(parsed.amounts.get("social_security_wages"), Some(&dec!(52000.00)));
        assert_eq!(parsed.amounts.get("state_wages"), Some(&dec!(50000.00)));
        assert_eq!(parsed.amounts.get("state_withheld"), Some(&dec!(2450.00)));
        assert_eq!(parsed.attributes.get("state").map(String::as_str), Some("MA"));
        assert_eq!(parsed.attributes.get("employer_ein").map(String::as_str), Some("12-3456789"));
        assert_eq!(
            parsed.attributes.get("employer_name").map(String::as_str),
            Some("Acme Widgets Inc")
        );
        assert!(parsed.missing_required.is_empty());
    }

    #[test]
    fn test_parse_reports_missing_required() {
        let text = "Form W-2\n1 Wages, tips, other compensation 1,000.00\n";

        let parsed = parse_fields(text, &profile_for(DocumentKind::W2));

        assert_eq!(parsed.missing_required, vec!["federal_withheld".to_string()]);
        assert_eq!(parsed.completeness(2), 0.5);
    }

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount("$1,234.56"), Some(dec!(1234.56)));
        assert_eq!(parse_amount("1234"), Some(dec!(1234)));
        assert_eq!(parse_amount("(1,234.56)"), Some(dec!(-1234.56)));
        assert_eq!(parse_amount("-12.50"), Some(dec!(-12.50)));
        assert_eq!(parse_amount("  "), None);
        assert_eq!(parse_amount("$"), None);
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let profile = DocumentProfile {
            kind: DocumentKind::Form1099Nec,
            description: "broken".to_string(),
            form_patterns: vec!["[invalid".to_string()],
            keywords: vec![],
            fields: vec![FieldPattern {
                field: "nonemployee_compensation".to_string(),
                label: "Box 1".to_string(),
                patterns: vec!["(unclosed".to_string()],
                value_type: ValueType::Amount,
            }],
            required: vec!["nonemployee_compensation".to_string()],
        };

        let compiled = CompiledProfile::compile(&profile);

        assert_eq!(compiled.score("1099-NEC"), 0);
        let parsed = parse_fields("Nonemployee compensation 500.00", &compiled);
        assert!(parsed.amounts.is_empty());
        assert_eq!(parsed.missing_required, vec!["nonemployee_compensation".to_string()]);
    }

    #[test]
    fn test_state_pattern_ignores_lowercase_words() {
        let text = "Form W-2\nState wages, tips, etc. 100.00\n";

        let parsed = parse_fields(text, &profile_for(DocumentKind::W2));

        assert!(parsed.attributes.get("state").is_none());
    }
}

//! Tax session and document types.
//!
//! A session is read and written as a whole document; every mutation goes
//! through the session service, which bumps `revision` on save.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Canonical field names shared by the parser, the refund rules and the forms.
pub mod field {
    pub const WAGES: &str = "wages";
    pub const FEDERAL_WITHHELD: &str = "federal_withheld";
    pub const STATE_WAGES: &str = "state_wages";
    pub const STATE_WITHHELD: &str = "state_withheld";
    pub const INTEREST_INCOME: &str = "interest_income";
    pub const ORDINARY_DIVIDENDS: &str = "ordinary_dividends";
    pub const QUALIFIED_DIVIDENDS: &str = "qualified_dividends";
    pub const NONEMPLOYEE_COMPENSATION: &str = "nonemployee_compensation";
    pub const RENTS: &str = "rents";
    pub const ROYALTIES: &str = "royalties";
    pub const OTHER_INCOME: &str = "other_income";
    pub const GROSS_DISTRIBUTION: &str = "gross_distribution";
    pub const TAXABLE_AMOUNT: &str = "taxable_amount";
    pub const UNEMPLOYMENT_COMPENSATION: &str = "unemployment_compensation";

    pub const STATE: &str = "state";
    pub const EMPLOYER_NAME: &str = "employer_name";
    pub const PAYER_NAME: &str = "payer_name";
}

/// Per-user, per-year working record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxSession {
    pub id: String,
    pub user_id: String,
    pub tax_year: i32,
    #[serde(default)]
    pub documents: Vec<TaxDocument>,
    #[serde(default)]
    pub filing_status: FilingStatus,
    #[serde(default)]
    pub dependents: Vec<Dependent>,
    #[serde(default)]
    pub refund_estimate: Decimal,
    /// Optimistic concurrency counter, incremented by every successful save.
    #[serde(default)]
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaxSession {
    pub fn new(user_id: impl Into<String>, tax_year: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            tax_year,
            documents: Vec::new(),
            filing_status: FilingStatus::default(),
            dependents: Vec::new(),
            refund_estimate: Decimal::ZERO,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn document(&self, id: &str) -> Option<&TaxDocument> {
        self.documents.iter().find(|d| d.id == id)
    }

    /// Find an already-ingested document with the same uploaded bytes.
    pub fn document_by_hash(&self, content_hash: &str) -> Option<&TaxDocument> {
        self.documents
            .iter()
            .find(|d| d.content_hash.as_deref() == Some(content_hash))
    }

    /// Distinct upper-case state codes referenced by any document, sorted.
    pub fn states(&self) -> Vec<String> {
        let mut states: Vec<String> = self
            .documents
            .iter()
            .filter_map(|d| d.state().map(str::to_string))
            .collect();
        states.sort();
        states.dedup();
        states
    }
}

/// An uploaded or manually entered tax form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxDocument {
    pub id: String,
    pub kind: DocumentKind,
    #[serde(default)]
    pub amounts: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Required fields the extractor could not find.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl TaxDocument {
    pub fn new(kind: DocumentKind) -> Self {
        Self {
            id: format!("doc_{}", Uuid::new_v4().simple()),
            kind,
            amounts: BTreeMap::new(),
            attributes: BTreeMap::new(),
            source_file: None,
            content_hash: None,
            ocr_provider: None,
            confidence: None,
            missing_fields: Vec::new(),
            uploaded_at: Utc::now(),
        }
    }

    pub fn with_amount(mut self, field: &str, value: Decimal) -> Self {
        self.amounts.insert(field.to_string(), value);
        self
    }

    pub fn with_attribute(mut self, field: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(field.to_string(), value.into());
        self
    }

    /// Amount for a field, zero when absent.
    pub fn amount(&self, field: &str) -> Decimal {
        self.amounts.get(field).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn amount_opt(&self, field: &str) -> Option<Decimal> {
        self.amounts.get(field).copied()
    }

    pub fn attribute(&self, field: &str) -> Option<&str> {
        self.attributes.get(field).map(String::as_str)
    }

    /// Two-letter state code this document reports to, if any.
    pub fn state(&self) -> Option<&str> {
        self.attribute(field::STATE).filter(|s| !s.is_empty())
    }

    /// Display name of the employer or payer.
    pub fn issuer(&self) -> Option<&str> {
        self.attribute(field::EMPLOYER_NAME)
            .or_else(|| self.attribute(field::PAYER_NAME))
    }
}

/// Document type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentKind {
    #[serde(rename = "W2")]
    W2,
    #[serde(rename = "1099-INT")]
    Form1099Int,
    #[serde(rename = "1099-DIV")]
    Form1099Div,
    #[serde(rename = "1099-NEC")]
    Form1099Nec,
    #[serde(rename = "1099-MISC")]
    Form1099Misc,
    #[serde(rename = "1099-R")]
    Form1099R,
    #[serde(rename = "1099-G")]
    Form1099G,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 7] = [
        Self::W2,
        Self::Form1099Int,
        Self::Form1099Div,
        Self::Form1099Nec,
        Self::Form1099Misc,
        Self::Form1099R,
        Self::Form1099G,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::W2 => "W2",
            Self::Form1099Int => "1099-INT",
            Self::Form1099Div => "1099-DIV",
            Self::Form1099Nec => "1099-NEC",
            Self::Form1099Misc => "1099-MISC",
            Self::Form1099R => "1099-R",
            Self::Form1099G => "1099-G",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Lenient parse: accepts `W-2`, `w2`, `1099int`, `1099-INT`, ...
    pub fn parse(s: &str) -> Option<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match key.as_str() {
            "W2" => Some(Self::W2),
            "1099INT" => Some(Self::Form1099Int),
            "1099DIV" => Some(Self::Form1099Div),
            "1099NEC" => Some(Self::Form1099Nec),
            "1099MISC" => Some(Self::Form1099Misc),
            "1099R" => Some(Self::Form1099R),
            "1099G" => Some(Self::Form1099G),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilingStatus {
    #[default]
    Single,
    MarriedFilingJointly,
    MarriedFilingSeparately,
    HeadOfHousehold,
    QualifyingSurvivingSpouse,
}

impl FilingStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Single => "Single",
            Self::MarriedFilingJointly => "Married filing jointly",
            Self::MarriedFilingSeparately => "Married filing separately",
            Self::HeadOfHousehold => "Head of household",
            Self::QualifyingSurvivingSpouse => "Qualifying surviving spouse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependent {
    pub name: String,
    pub relationship: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_year: Option<i32>,
}

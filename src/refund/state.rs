//! Per-state flat-rate rules.

use rust_decimal::Decimal;

use super::federal::federal_income;
use super::rates::StateRateTable;
use super::JurisdictionRules;
use crate::schema::{field, TaxDocument};

#[derive(Debug, Clone, PartialEq)]
pub struct StateRules {
    code: String,
    name: String,
    rate: Decimal,
}

impl StateRules {
    pub fn new(code: impl Into<String>, name: impl Into<String>, rate: Decimal) -> Self {
        Self {
            code: code.into().to_ascii_uppercase(),
            name: name.into(),
            rate,
        }
    }

    /// Select the rules for a state, `None` when the table has no entry.
    pub fn for_state(code: &str, rates: &StateRateTable) -> Option<Self> {
        rates
            .get(code)
            .map(|record| Self::new(&record.state, &record.name, record.rate))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_income_tax(&self) -> bool {
        !self.rate.is_zero()
    }
}

/// State wages when reported, otherwise the federal income of the document.
fn state_income(doc: &TaxDocument) -> Decimal {
    doc.amount_opt(field::STATE_WAGES)
        .unwrap_or_else(|| federal_income(doc))
}

impl JurisdictionRules for StateRules {
    fn jurisdiction(&self) -> &str {
        &self.code
    }

    fn rate(&self) -> Decimal {
        self.rate
    }

    fn income(&self, documents: &[&TaxDocument]) -> Decimal {
        documents.iter().map(|d| state_income(d)).sum()
    }

    fn withheld(&self, documents: &[&TaxDocument]) -> Decimal {
        documents
            .iter()
            .map(|d| d.amount(field::STATE_WITHHELD))
            .sum()
    }
}

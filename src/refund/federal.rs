//! Federal flat-rate rules.

use rust_decimal::Decimal;

use super::JurisdictionRules;
use crate::schema::{field, DocumentKind, TaxDocument};

/// 10% of total income.
pub const FEDERAL_FLAT_RATE: Decimal = Decimal::from_parts(10, 0, 0, false, 2);

/// Income a single document contributes to the federal return.
pub fn federal_income(doc: &TaxDocument) -> Decimal {
    match doc.kind {
        DocumentKind::W2 => doc.amount(field::WAGES),
        DocumentKind::Form1099Int => doc.amount(field::INTEREST_INCOME),
        DocumentKind::Form1099Div => doc.amount(field::ORDINARY_DIVIDENDS),
        DocumentKind::Form1099Nec => doc.amount(field::NONEMPLOYEE_COMPENSATION),
        DocumentKind::Form1099Misc => {
            doc.amount(field::RENTS) + doc.amount(field::ROYALTIES) + doc.amount(field::OTHER_INCOME)
        }
        // Box 2a is blank on some forms; fall back to the gross distribution.
        DocumentKind::Form1099R => doc
            .amount_opt(field::TAXABLE_AMOUNT)
            .unwrap_or_else(|| doc.amount(field::GROSS_DISTRIBUTION)),
        DocumentKind::Form1099G => doc.amount(field::UNEMPLOYMENT_COMPENSATION),
        DocumentKind::Unknown => Decimal::ZERO,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FederalRules;

impl JurisdictionRules for FederalRules {
    fn jurisdiction(&self) -> &str {
        "US"
    }

    fn rate(&self) -> Decimal {
        FEDERAL_FLAT_RATE
    }

    fn income(&self, documents: &[&TaxDocument]) -> Decimal {
        documents.iter().map(|d| federal_income(d)).sum()
    }

    fn withheld(&self, documents: &[&TaxDocument]) -> Decimal {
        documents
            .iter()
            .map(|d| d.amount(field::FEDERAL_WITHHELD))
            .sum()
    }
}

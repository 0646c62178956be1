//! Generic state return layout for flat-rate states.

use rust_decimal::Decimal;

use super::{FormError, FormLayout, FormLine};
use crate::refund::{JurisdictionRules, StateRateTable, StateRules};
use crate::schema::TaxSession;

/// A state with no documents still renders, with zero amounts.
pub fn layout(
    session: &TaxSession,
    code: &str,
    rates: &StateRateTable,
) -> Result<FormLayout, FormError> {
    let rules = StateRules::for_state(code, rates)
        .ok_or_else(|| FormError::UnknownState(code.to_string()))?;

    let documents: Vec<_> = session
        .documents
        .iter()
        .filter(|d| d.state().is_some_and(|s| s.eq_ignore_ascii_case(code)))
        .collect();
    let result = rules.compute(&documents);

    let rate_percent = (result.rate * Decimal::ONE_HUNDRED).normalize();

    Ok(FormLayout {
        title: format!("{} Individual Income Tax Return {}", rules.name(), session.tax_year),
        lines: vec![
            FormLine::text("state", "State", rules.jurisdiction()),
            FormLine::text("tax_year", "Tax year", session.tax_year.to_string()),
            FormLine::text("filing_status", "Filing status", session.filing_status.label()),
            FormLine::text("documents", "Documents reported", documents.len().to_string()),
            FormLine::money("income", "State taxable income", result.income),
            FormLine::text(
                "income_tax",
                "State taxes wage income",
                if rules.has_income_tax() { "Yes" } else { "No" },
            ),
            FormLine::text("rate", "Flat tax rate (%)", rate_percent.to_string()),
            FormLine::money("tax", "State income tax", result.tax),
            FormLine::money("withheld", "State tax withheld", result.withheld),
            FormLine::money("refund", "Refund", result.refund.max(Decimal::ZERO)),
            FormLine::money("amount_owed", "Amount you owe", result.amount_owed()),
        ],
    })
}

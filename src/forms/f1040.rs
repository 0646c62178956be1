//! Form 1040 layout.

use rust_decimal::Decimal;

use super::{FormLayout, FormLine};
use crate::refund::{self, StateRateTable};
use crate::schema::{field, DocumentKind, TaxSession};

fn total(session: &TaxSession, kind: DocumentKind, name: &str) -> Decimal {
    session
        .documents
        .iter()
        .filter(|d| d.kind == kind)
        .map(|d| d.amount(name))
        .sum()
}

/// Taxable 1099-R amount, falling back to the gross distribution.
fn retirement_taxable(session: &TaxSession) -> Decimal {
    session
        .documents
        .iter()
        .filter(|d| d.kind == DocumentKind::Form1099R)
        .map(|d| {
            d.amount_opt(field::TAXABLE_AMOUNT)
                .unwrap_or_else(|| d.amount(field::GROSS_DISTRIBUTION))
        })
        .sum()
}

pub fn layout(session: &TaxSession, rates: &StateRateTable) -> FormLayout {
    let breakdown = refund::calculate(&session.documents, rates);
    let federal = &breakdown.federal;

    let wages = total(session, DocumentKind::W2, field::WAGES);
    let interest = total(session, DocumentKind::Form1099Int, field::INTEREST_INCOME);
    let ordinary_dividends = total(session, DocumentKind::Form1099Div, field::ORDINARY_DIVIDENDS);
    let qualified_dividends = total(session, DocumentKind::Form1099Div, field::QUALIFIED_DIVIDENDS);
    let pensions = retirement_taxable(session);
    let other = total(session, DocumentKind::Form1099Nec, field::NONEMPLOYEE_COMPENSATION)
        + total(session, DocumentKind::Form1099Misc, field::RENTS)
        + total(session, DocumentKind::Form1099Misc, field::ROYALTIES)
        + total(session, DocumentKind::Form1099Misc, field::OTHER_INCOME)
        + total(session, DocumentKind::Form1099G, field::UNEMPLOYMENT_COMPENSATION);

    let w2_withheld = total(session, DocumentKind::W2, field::FEDERAL_WITHHELD);
    let other_withheld = federal.withheld - w2_withheld;

    let overpaid = federal.refund.max(Decimal::ZERO);

    FormLayout {
        title: format!("Form 1040 U.S. Individual Income Tax Return {}", session.tax_year),
        lines: vec![
            FormLine::text("tax_year", "Tax year", session.tax_year.to_string()),
            FormLine::text("filing_status", "Filing status", session.filing_status.label()),
            FormLine::text(
                "dependents",
                "Number of dependents",
                session.dependents.len().to_string(),
            ),
            FormLine::money("line_1a", "1a Wages, salaries, tips (W-2 box 1)", wages),
            FormLine::money("line_2b", "2b Taxable interest", interest),
            FormLine::money("line_3a", "3a Qualified dividends", qualified_dividends),
            FormLine::money("line_3b", "3b Ordinary dividends", ordinary_dividends),
            FormLine::money("line_5b", "5b Pensions and annuities, taxable amount", pensions),
            FormLine::money("line_8", "8 Additional income", other),
            FormLine::money("line_9", "9 Total income", federal.income),
            FormLine::money("line_16", "16 Tax", federal.tax),
            FormLine::money("line_25a", "25a Federal income tax withheld from W-2", w2_withheld),
            FormLine::money("line_25b", "25b Federal income tax withheld from 1099", other_withheld),
            FormLine::money("line_25d", "25d Total withholding", federal.withheld),
            FormLine::money("line_34", "34 Amount overpaid", overpaid),
            FormLine::money("line_37", "37 Amount you owe", federal.amount_owed()),
        ],
    }
}

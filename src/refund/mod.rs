//! Refund estimation.
//!
//! Federal and state rules are independent [`JurisdictionRules`]
//! implementations over the session's documents. The estimate is recomputed
//! from scratch on every call; nothing here touches storage.

pub mod federal;
pub mod rates;
pub mod state;

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::schema::TaxDocument;
pub use federal::FederalRules;
pub use rates::StateRateTable;
pub use state::StateRules;

/// Rules for one taxing jurisdiction.
pub trait JurisdictionRules {
    /// `US` for federal, the two-letter code for a state.
    fn jurisdiction(&self) -> &str;

    fn rate(&self) -> Decimal;

    fn income(&self, documents: &[&TaxDocument]) -> Decimal;

    fn withheld(&self, documents: &[&TaxDocument]) -> Decimal;

    fn compute(&self, documents: &[&TaxDocument]) -> JurisdictionResult {
        let income = round_half_up(self.income(documents));
        let tax = round_half_up(income * self.rate());
        let withheld = round_half_up(self.withheld(documents));

        JurisdictionResult {
            jurisdiction: self.jurisdiction().to_string(),
            income,
            rate: self.rate(),
            tax,
            withheld,
            refund: round_half_up(withheld - tax),
            document_count: documents.len(),
        }
    }
}

/// Outcome for a single jurisdiction. Negative `refund` is an amount owed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JurisdictionResult {
    pub jurisdiction: String,
    pub income: Decimal,
    pub rate: Decimal,
    pub tax: Decimal,
    pub withheld: Decimal,
    pub refund: Decimal,
    pub document_count: usize,
}

impl JurisdictionResult {
    pub fn amount_owed(&self) -> Decimal {
        if self.refund < Decimal::ZERO {
            -self.refund
        } else {
            Decimal::ZERO
        }
    }
}

/// Full refund computation. Only `total` is persisted on the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundBreakdown {
    pub federal: JurisdictionResult,
    pub states: Vec<JurisdictionResult>,
    /// State codes found on documents but absent from the rate table.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unsupported_states: Vec<String>,
    pub total: Decimal,
}

#[cfg(test)]
impl RefundBreakdown {
    pub fn state(&self, code: &str) -> Option<&JurisdictionResult> {
        self.states
            .iter()
            .find(|s| s.jurisdiction.eq_ignore_ascii_case(code))
    }
}

/// Compute federal and per-state results for a set of documents.
pub fn calculate(documents: &[TaxDocument], rates: &StateRateTable) -> RefundBreakdown {
    let all: Vec<&TaxDocument> = documents.iter().collect();
    let federal = FederalRules.compute(&all);

    let mut by_state: BTreeMap<String, Vec<&TaxDocument>> = BTreeMap::new();
    for doc in documents {
        if let Some(code) = doc.state() {
            by_state.entry(code.to_ascii_uppercase()).or_default().push(doc);
        }
    }

    let mut states = Vec::new();
    let mut unsupported_states = Vec::new();
    for (code, docs) in by_state {
        match StateRules::for_state(&code, rates) {
            Some(rules) => states.push(rules.compute(&docs)),
            None => unsupported_states.push(code),
        }
    }

    let total = round_half_up(
        states
            .iter()
            .fold(federal.refund, |acc, s| acc + s.refund),
    );

    RefundBreakdown {
        federal,
        states,
        unsupported_states,
        total,
    }
}

/// The refund estimate stored on a session: federal plus all states.
pub fn estimate_refund(documents: &[TaxDocument], rates: &StateRateTable) -> Decimal {
    calculate(documents, rates).total
}

/// Rounds to two decimal places, midpoint away from zero.
pub fn round_half_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
}

//! Flat state income-tax rates, loaded from CSV.
//!
//! The compiled-in table lives in `data/state_rates.csv`; a deployment can
//! point `STATE_RATES_PATH` at a file with the same columns.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::info;

const EMBEDDED_RATES: &str = include_str!("../../data/state_rates.csv");

#[derive(Debug, Error)]
pub enum RateTableError {
    #[error("CSV parse error: {0}")]
    CsvParse(String),

    #[error("Invalid state code '{0}' (expected two letters)")]
    InvalidState(String),

    #[error("Rate for {state} out of range: {rate}")]
    InvalidRate { state: String, rate: Decimal },

    #[error("Failed to read rate table: {0}")]
    Io(#[from] std::io::Error),
}

impl From<csv::Error> for RateTableError {
    fn from(err: csv::Error) -> Self {
        RateTableError::CsvParse(err.to_string())
    }
}

/// One row of the rate CSV.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StateRateRecord {
    pub state: String,
    pub name: String,
    pub rate: Decimal,
}

/// Rate table keyed by upper-case two-letter code.
#[derive(Debug, Clone, Default)]
pub struct StateRateTable {
    rates: BTreeMap<String, StateRateRecord>,
}

impl StateRateTable {
    /// The table shipped with the binary.
    pub fn embedded() -> Result<Self, RateTableError> {
        Self::from_reader(EMBEDDED_RATES.as_bytes())
    }

    pub fn from_path(path: &Path) -> Result<Self, RateTableError> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file)?;
        info!("Loaded {} state rates from {:?}", table.len(), path);
        Ok(table)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RateTableError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut rates = BTreeMap::new();
        for result in csv_reader.deserialize() {
            let mut record: StateRateRecord = result?;
            record.state = record.state.to_ascii_uppercase();

            if record.state.len() != 2 || !record.state.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(RateTableError::InvalidState(record.state));
            }
            if record.rate < Decimal::ZERO || record.rate >= Decimal::ONE {
                return Err(RateTableError::InvalidRate {
                    state: record.state,
                    rate: record.rate,
                });
            }

            rates.insert(record.state.clone(), record);
        }

        Ok(Self { rates })
    }

    pub fn get(&self, state: &str) -> Option<&StateRateRecord> {
        self.rates.get(&state.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }
}

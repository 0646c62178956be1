//! PDF form generation.
//!
//! A form is first laid out as a list of keyed lines computed from the
//! session, then rendered: into a template's AcroForm fields when a template
//! exists, otherwise onto a generated summary page.

pub mod f1040;
pub mod render;
pub mod state;

use rust_decimal::Decimal;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::refund::{round_half_up, StateRateTable};
use crate::schema::TaxSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormKind {
    F1040,
    /// Upper-case two-letter state code.
    State(String),
}

impl FormKind {
    pub fn state(code: &str) -> Self {
        FormKind::State(code.trim().to_ascii_uppercase())
    }

    /// File name looked up in the templates directory.
    pub fn template_name(&self) -> String {
        match self {
            FormKind::F1040 => "f1040.pdf".to_string(),
            FormKind::State(code) => format!("state_{}.pdf", code.to_ascii_lowercase()),
        }
    }

    /// Suggested download name.
    pub fn file_name(&self, tax_year: i32) -> String {
        match self {
            FormKind::F1040 => format!("1040_{}.pdf", tax_year),
            FormKind::State(code) => format!("{}_{}.pdf", code.to_ascii_lowercase(), tax_year),
        }
    }
}

#[derive(Debug, Error)]
pub enum FormError {
    #[error("No state income tax rate is known for {0}")]
    UnknownState(String),

    #[error("Failed to read template {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: lopdf::Error,
    },

    #[error("Failed to build PDF: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Failed to write PDF: {0}")]
    Io(#[from] std::io::Error),

    #[error("Form rendering task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One printed line of a form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormLine {
    /// AcroForm field name.
    pub key: String,
    pub label: String,
    pub value: String,
}

impl FormLine {
    pub fn text(key: &str, label: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            value: value.into(),
        }
    }

    pub fn money(key: &str, label: &str, value: Decimal) -> Self {
        Self::text(key, label, format_money(value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormLayout {
    pub title: String,
    pub lines: Vec<FormLine>,
}

#[cfg(test)]
impl FormLayout {
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }
}

pub fn layout(
    session: &TaxSession,
    form: &FormKind,
    rates: &StateRateTable,
) -> Result<FormLayout, FormError> {
    match form {
        FormKind::F1040 => Ok(f1040::layout(session, rates)),
        FormKind::State(code) => state::layout(session, code, rates),
    }
}

/// Produce the PDF bytes for a form.
pub fn render(
    session: &TaxSession,
    form: &FormKind,
    rates: &StateRateTable,
    templates_dir: Option<&Path>,
) -> Result<Vec<u8>, FormError> {
    let layout = layout(session, form, rates)?;

    if let Some(path) = templates_dir
        .map(|dir| dir.join(form.template_name()))
        .filter(|p| p.is_file())
    {
        info!("Filling template {} for session {}", path.display(), session.id);
        return render::fill_template(&path, &layout);
    }

    info!("Generating {} for session {}", layout.title, session.id);
    render::generate(&layout)
}

/// [`render`] on the blocking pool. Template reads and PDF encoding are
/// synchronous.
pub async fn render_blocking(
    session: TaxSession,
    form: FormKind,
    rates: Arc<StateRateTable>,
    templates_dir: Option<PathBuf>,
) -> Result<Vec<u8>, FormError> {
    tokio::task::spawn_blocking(move || render(&session, &form, &rates, templates_dir.as_deref()))
        .await?
}

/// `1234.5` -> `1,234.50`, `-20` -> `-20.00`.
pub fn format_money(value: Decimal) -> String {
    let rounded = format!("{:.2}", round_half_up(value).abs());
    let (whole, cents) = rounded.split_once('.').unwrap_or((rounded.as_str(), "00"));

    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < Decimal::ZERO { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, cents)
}

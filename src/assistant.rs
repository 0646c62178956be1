//! CPA-style chat assistant over the completion API.

use std::fmt::Write as _;

use crate::openai::{ChatBackend, Message};
use crate::schema::{field, TaxSession};
use thiserror::Error;
use tracing::{debug, info};

pub const SYSTEM_PROMPT: &str = "You are a friendly, careful certified public accountant \
helping an individual prepare their U.S. federal and state income tax return. \
Answer questions about U.S. individual income tax only: income documents (W-2 and 1099 forms), \
filing status, dependents, withholding, deductions, credits and refunds. \
When the user's session data is provided, ground your answer in it and cite the relevant amounts. \
Refund figures in the session are flat-rate estimates, not a prepared return; say so when it matters. \
If a question is outside individual income tax, politely decline. \
Never invent document values that are not in the session.";

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("Question must not be empty")]
    EmptyQuestion,

    #[error("Completion API failed: {0:#}")]
    Backend(anyhow::Error),
}

/// Assemble the conversation sent to the model.
pub fn build_messages(session: &TaxSession, question: &str, include_context: bool) -> Vec<Message> {
    let mut messages = vec![Message::system(SYSTEM_PROMPT)];
    if include_context {
        messages.push(Message::system(session_context(session)));
    }
    messages.push(Message::user(question.trim()));
    messages
}

/// Ask the assistant a question. The reply is returned as the model wrote it.
pub async fn ask(
    backend: &dyn ChatBackend,
    session: &TaxSession,
    question: &str,
    include_context: bool,
) -> Result<String, AssistantError> {
    if question.trim().is_empty() {
        return Err(AssistantError::EmptyQuestion);
    }

    let messages = build_messages(session, question, include_context);
    debug!(
        "Assistant request for session {} ({} messages, context={})",
        session.id,
        messages.len(),
        include_context
    );

    let reply = backend
        .complete(messages)
        .await
        .map_err(AssistantError::Backend)?;

    info!(
        "Assistant replied for session {} via {} ({} chars)",
        session.id,
        backend.model(),
        reply.len()
    );
    Ok(reply)
}

/// Plain-text summary of the session for the model.
pub fn session_context(session: &TaxSession) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Tax session summary");
    let _ = writeln!(out, "Tax year: {}", session.tax_year);
    let _ = writeln!(out, "Filing status: {}", session.filing_status.label());

    if session.dependents.is_empty() {
        let _ = writeln!(out, "Dependents: none");
    } else {
        let _ = writeln!(out, "Dependents:");
        for dep in &session.dependents {
            match dep.birth_year {
                Some(year) => {
                    let _ = writeln!(out, "- {} ({}, born {})", dep.name, dep.relationship, year);
                }
                None => {
                    let _ = writeln!(out, "- {} ({})", dep.name, dep.relationship);
                }
            }
        }
    }

    if session.documents.is_empty() {
        let _ = writeln!(out, "Documents: none uploaded yet");
    } else {
        let _ = writeln!(out, "Documents:");
        for doc in &session.documents {
            let mut line = format!("- {}", doc.kind);
            if let Some(issuer) = doc.issuer() {
                let _ = write!(line, " from {}", issuer);
            }
            if let Some(state) = doc.state() {
                let _ = write!(line, " [{}]", state);
            }
            let amounts: Vec<String> = doc
                .amounts
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            if !amounts.is_empty() {
                let _ = write!(line, ": {}", amounts.join(", "));
            }
            if !doc.missing_fields.is_empty() {
                let _ = write!(line, " (unread: {})", doc.missing_fields.join(", "));
            }
            let _ = writeln!(out, "{}", line);
        }
    }

    let states = session.states();
    if !states.is_empty() {
        let _ = writeln!(out, "States with documents: {}", states.join(", "));
    }

    let withheld: rust_decimal::Decimal = session
        .documents
        .iter()
        .map(|d| d.amount(field::FEDERAL_WITHHELD))
        .sum();
    let _ = writeln!(out, "Total federal withholding: {}", withheld);
    let _ = write!(out, "Estimated refund (negative means owed): {}", session.refund_estimate);
    out
}

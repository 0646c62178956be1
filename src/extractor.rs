//! Document extraction pipeline: OCR, classification, field parsing and an
//! optional language-model pass for fields the heuristics missed.

use crate::config::{DocumentProfile, ProfileStore, ValueType};
use crate::fields::{self, ParsedFields};
use crate::ocr::{OcrError, OcrRegistry, OcrResult};
use crate::openai::{ChatBackend, Message};
use crate::schema::{DocumentKind, TaxDocument};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Characters of document text sent to the model.
const MAX_LLM_CHARS: usize = 20_000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error("Could not recognize {0} as a W-2 or 1099 form; pass an explicit kind")]
    Unrecognized(String),

    #[error("No profile configured for {0}")]
    NoProfile(DocumentKind),
}

/// Extraction pipeline orchestrator.
#[derive(Clone)]
pub struct Extractor {
    ocr: OcrRegistry,
    profiles: ProfileStore,
    llm: Option<Arc<dyn ChatBackend>>,
}

impl Extractor {
    pub fn new(ocr: OcrRegistry, profiles: ProfileStore) -> Self {
        Self {
            ocr,
            profiles,
            llm: None,
        }
    }

    /// Enable the model pass for missing fields.
    pub fn with_llm_fallback(mut self, llm: Arc<dyn ChatBackend>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Turn an uploaded file into a [`TaxDocument`].
    pub async fn extract(
        &self,
        filename: &str,
        data: &[u8],
        kind_hint: Option<DocumentKind>,
    ) -> Result<TaxDocument, ExtractError> {
        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(data);
            format!("{:x}", hasher.finalize())
        };

        info!(
            "Starting extraction for: {} ({} bytes, hint={:?})",
            filename,
            data.len(),
            kind_hint
        );

        let ocr = self.ocr.process(filename, data).await?;
        debug!(
            "{}: {} chars from {} page(s) via {}",
            filename,
            ocr.text.len(),
            ocr.total_pages,
            ocr.provider_name
        );

        let mut document = self.extract_from_text(filename, &ocr, kind_hint).await?;
        document.content_hash = Some(content_hash);
        Ok(document)
    }

    /// Classification and parsing over already-extracted text.
    pub async fn extract_from_text(
        &self,
        filename: &str,
        ocr: &OcrResult,
        kind_hint: Option<DocumentKind>,
    ) -> Result<TaxDocument, ExtractError> {
        let all_profiles = self.profiles.all();
        let compiled = fields::compile_all(&all_profiles);

        let kind = match kind_hint.filter(|k| *k != DocumentKind::Unknown) {
            Some(kind) => kind,
            None => fields::classify(&ocr.text, &compiled),
        };
        if kind == DocumentKind::Unknown {
            return Err(ExtractError::Unrecognized(filename.to_string()));
        }

        let profile = all_profiles
            .iter()
            .find(|p| p.kind == kind)
            .ok_or(ExtractError::NoProfile(kind))?;
        let compiled_profile = compiled
            .iter()
            .find(|p| p.kind == kind)
            .ok_or(ExtractError::NoProfile(kind))?;

        let mut parsed = fields::parse_fields(&ocr.text, compiled_profile);
        debug!(
            "{} parsed as {}: {} amounts, {} attributes, missing {:?}",
            filename,
            kind,
            parsed.amounts.len(),
            parsed.attributes.len(),
            parsed.missing_required
        );

        if let Some(llm) = &self.llm {
            let unfilled: Vec<&str> = profile
                .fields
                .iter()
                .map(|f| f.field.as_str())
                .filter(|f| !parsed.contains(f))
                .collect();
            if !parsed.missing_required.is_empty() && !unfilled.is_empty() {
                match self.ask_model(llm.as_ref(), profile, &ocr.paged_text(), &unfilled).await {
                    Ok(value) => merge_model_fields(&mut parsed, profile, &value),
                    Err(e) => warn!("Model field extraction failed for {}: {:#}", filename, e),
                }
            }
        }

        let confidence = ocr.ocr_confidence * parsed.completeness(profile.required.len());

        let mut document = TaxDocument::new(kind);
        document.amounts = parsed.amounts;
        document.attributes = parsed.attributes;
        document.missing_fields = parsed.missing_required;
        document.source_file = Some(filename.to_string());
        document.ocr_provider = Some(ocr.provider_name.clone());
        document.confidence = Some(confidence);

        info!(
            "Extraction complete: {} as {} (confidence {:.2})",
            filename, kind, confidence
        );

        Ok(document)
    }

    async fn ask_model(
        &self,
        llm: &dyn ChatBackend,
        profile: &DocumentProfile,
        text: &str,
        fields: &[&str],
    ) -> anyhow::Result<serde_json::Value> {
        let descriptions: Vec<String> = profile
            .fields
            .iter()
            .filter(|f| fields.contains(&f.field.as_str()))
            .map(|f| format!("- {}: {}", f.field, f.label))
            .collect();

        let system_prompt = format!(
            "You read U.S. tax forms and return field values as JSON.\n\n--- DOCUMENT START ({}) ---\n\n{}\n\n--- DOCUMENT END ---",
            profile.description,
            truncate_for_context(text, MAX_LLM_CHARS)
        );
        let user_prompt = format!(
            "Return a JSON object with exactly these keys:\n{}\n\nAmounts are plain numbers without $ or commas. Use null for any value not printed on the form.",
            descriptions.join("\n")
        );

        debug!("Asking {} for {} missing fields", llm.model(), fields.len());
        llm.complete_json(vec![Message::system(system_prompt), Message::user(user_prompt)])
            .await
    }
}

/// Merge model answers into parsed fields. Heuristic values win.
fn merge_model_fields(parsed: &mut ParsedFields, profile: &DocumentProfile, value: &serde_json::Value) {
    let Some(obj) = value.as_object() else {
        warn!("Model returned non-object JSON; ignoring");
        return;
    };

    for field in &profile.fields {
        if parsed.contains(&field.field) {
            continue;
        }
        let Some(raw) = obj.get(&field.field) else {
            continue;
        };
        let raw = match raw {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => continue,
        };

        match field.value_type {
            ValueType::Amount => {
                if let Some(amount) = fields::parse_amount(&raw) {
                    parsed.amounts.insert(field.field.clone(), amount);
                }
            }
            ValueType::State => {
                let code = raw.trim().to_ascii_uppercase();
                if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                    parsed.attributes.insert(field.field.clone(), code);
                }
            }
            ValueType::Text => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    parsed.attributes.insert(field.field.clone(), trimmed.to_string());
                }
            }
        }
    }

    parsed
        .missing_required
        .retain(|f| !(parsed.amounts.contains_key(f) || parsed.attributes.contains_key(f)));
}

fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &text[..end]
    }
}

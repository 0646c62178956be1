//! Modular OCR provider abstraction.
//!
//! Defines the [`OcrProvider`] trait and unified types so the extractor does
//! not care whether text came from a PDF text layer, a plain upload or a
//! remote OCR service. [`OcrRegistry`] picks a provider per upload.

pub mod image_prep;
pub mod mistral;
pub mod pdf_text;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use image_prep::PreparedImage;

/// Minimum characters a PDF text layer must yield before we trust it.
const MIN_TEXT_LAYER_CHARS: usize = 20;

/// Per-page OCR output (always 1-indexed).
#[derive(Debug, Clone)]
pub struct OcrPage {
    pub page_num: u32,
    pub text: String,
}

/// Unified OCR result returned by every provider.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    pub pages: Vec<OcrPage>,
    pub total_pages: u32,
    pub ocr_confidence: f64,
    pub provider_name: String,
}

impl OcrResult {
    /// Count of non-whitespace characters across all pages.
    pub fn meaningful_chars(&self) -> usize {
        self.text.chars().filter(|c| !c.is_whitespace()).count()
    }

    /// Text with a marker before each page. Single-page results are returned
    /// unchanged.
    pub fn paged_text(&self) -> String {
        if self.pages.len() <= 1 {
            return self.text.clone();
        }
        self.pages
            .iter()
            .map(|p| format!("--- Page {} of {} ---\n{}", p.page_num, self.total_pages, p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Input to an OCR provider.
pub enum OcrInput {
    Pdf { filename: String, data: Vec<u8> },
    Image { filename: String, image: PreparedImage },
}

impl OcrInput {
    pub fn filename(&self) -> &str {
        match self {
            Self::Pdf { filename, .. } | Self::Image { filename, .. } => filename,
        }
    }
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn process(&self, input: &OcrInput) -> anyhow::Result<OcrResult>;
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Unsupported file type: {0}")]
    Unsupported(String),

    #[error("Could not decode image: {0}")]
    BadImage(String),

    #[error("{0} needs OCR but no OCR service is configured")]
    RemoteUnavailable(String),

    #[error("No text could be extracted from {0}")]
    Empty(String),

    #[error("OCR provider {provider} failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: anyhow::Error,
    },
}

/// What an upload looks like, judged from its bytes and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Pdf,
    Image,
    Text,
}

pub fn detect_format(filename: &str, data: &[u8]) -> Option<UploadFormat> {
    if data.starts_with(b"%PDF") {
        return Some(UploadFormat::Pdf);
    }
    if image::guess_format(data).is_ok() {
        return Some(UploadFormat::Image);
    }
    let lower = filename.to_lowercase();
    if lower.ends_with(".txt") || lower.ends_with(".md") || std::str::from_utf8(data).is_ok() {
        return Some(UploadFormat::Text);
    }
    None
}

/// Chooses a provider for each upload.
#[derive(Clone)]
pub struct OcrRegistry {
    pdf_text: Arc<pdf_text::PdfTextProvider>,
    remote: Option<Arc<dyn OcrProvider>>,
}

impl OcrRegistry {
    pub fn new(remote: Option<Arc<dyn OcrProvider>>) -> Self {
        Self {
            pdf_text: Arc::new(pdf_text::PdfTextProvider),
            remote,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Turn an upload into text.
    ///
    /// Plain text passes through; PDFs use their text layer when it has
    /// content and fall back to remote OCR; images always need remote OCR.
    pub async fn process(&self, filename: &str, data: &[u8]) -> Result<OcrResult, OcrError> {
        let format = detect_format(filename, data)
            .ok_or_else(|| OcrError::Unsupported(filename.to_string()))?;
        debug!("OcrRegistry: {} detected as {:?}", filename, format);

        match format {
            UploadFormat::Text => {
                let text = String::from_utf8_lossy(data).to_string();
                if text.trim().is_empty() {
                    return Err(OcrError::Empty(filename.to_string()));
                }
                Ok(plain_text_result(text))
            }
            UploadFormat::Pdf => {
                let input = OcrInput::Pdf {
                    filename: filename.to_string(),
                    data: data.to_vec(),
                };
                match self.pdf_text.process(&input).await {
                    Ok(result) if result.meaningful_chars() >= MIN_TEXT_LAYER_CHARS => Ok(result),
                    Ok(_) => {
                        info!("{} has no usable text layer, trying remote OCR", filename);
                        self.run_remote(&input).await
                    }
                    Err(e) => {
                        info!("{} text layer unreadable ({}), trying remote OCR", filename, e);
                        self.run_remote(&input).await
                    }
                }
            }
            UploadFormat::Image => {
                let image = image_prep::prepare(data).map_err(|e| OcrError::BadImage(e.to_string()))?;
                let input = OcrInput::Image {
                    filename: filename.to_string(),
                    image,
                };
                self.run_remote(&input).await
            }
        }
    }

    async fn run_remote(&self, input: &OcrInput) -> Result<OcrResult, OcrError> {
        let provider = self
            .remote
            .as_ref()
            .ok_or_else(|| OcrError::RemoteUnavailable(input.filename().to_string()))?;

        let result = provider
            .process(input)
            .await
            .map_err(|source| OcrError::Provider {
                provider: provider.name().to_string(),
                source,
            })?;

        if result.meaningful_chars() == 0 {
            return Err(OcrError::Empty(input.filename().to_string()));
        }
        Ok(result)
    }
}

fn plain_text_result(text: String) -> OcrResult {
    OcrResult {
        pages: vec![OcrPage {
            page_num: 1,
            text: text.clone(),
        }],
        text,
        total_pages: 1,
        ocr_confidence: 1.0,
        provider_name: "plain_text".to_string(),
    }
}

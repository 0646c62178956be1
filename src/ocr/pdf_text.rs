//! Local provider reading the embedded text layer of a PDF with lopdf.

use super::{OcrInput, OcrPage, OcrProvider, OcrResult};
use anyhow::Context;
use lopdf::Document;
use tracing::{debug, warn};

pub struct PdfTextProvider;

#[async_trait::async_trait]
impl OcrProvider for PdfTextProvider {
    fn name(&self) -> &str {
        "pdf_text"
    }

    async fn process(&self, input: &OcrInput) -> anyhow::Result<OcrResult> {
        let (filename, data) = match input {
            OcrInput::Pdf { filename, data } => (filename, data),
            OcrInput::Image { filename, .. } => {
                anyhow::bail!("{} is an image; the PDF text reader only handles PDFs", filename)
            }
        };

        let filename = filename.clone();
        let data = data.clone();
        tokio::task::spawn_blocking(move || read_text_layer(&filename, &data))
            .await
            .context("PDF text extraction task failed")?
    }
}

fn read_text_layer(filename: &str, data: &[u8]) -> anyhow::Result<OcrResult> {
    let doc = Document::load_mem(data)
        .map_err(|e| anyhow::anyhow!("Failed to load PDF {}: {}", filename, e))?;

    let mut pages = Vec::new();
    for (page_num, _) in doc.get_pages() {
        match doc.extract_text(&[page_num]) {
            Ok(text) => pages.push(OcrPage { page_num, text }),
            Err(e) => warn!("{}: page {} text extraction failed: {}", filename, page_num, e),
        }
    }

    let total_pages = doc.get_pages().len() as u32;
    let text = pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    debug!(
        "PdfTextProvider: {} -> {} pages, {} chars",
        filename,
        total_pages,
        text.len()
    );

    Ok(OcrResult {
        text,
        pages,
        total_pages,
        ocr_confidence: 0.99,
        provider_name: "pdf_text".to_string(),
    })
}

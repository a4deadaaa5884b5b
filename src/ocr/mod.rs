//! OCR engine interface.

use std::sync::Arc;

use crate::{pages::Page, prelude::*};

pub mod tesseract;

pub use self::tesseract::TesseractOptions;

/// Input record describing a page to OCR.
pub struct OcrPageInput {
    /// The name of the document this page came from.
    pub document: String,

    /// The index of the page within the document.
    pub page_idx: usize,

    /// The page to OCR.
    pub page: Page,
}

/// Output record describing the result of OCRing a page.
#[derive(Clone, Debug, Default)]
pub struct OcrPageOutput {
    /// The recognized text.
    pub text: String,

    /// Engine-reported confidence in `0.0..=1.0`, if the engine has one.
    pub confidence: Option<f32>,
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// OCR a single page.
    async fn ocr_page(&self, input: OcrPageInput) -> Result<OcrPageOutput>;
}

/// Get the OCR engine with the specified name.
pub fn ocr_engine_for_name(
    name: &str,
    tesseract_opts: &TesseractOptions,
) -> Result<Arc<dyn OcrEngine>> {
    match name {
        "tesseract" => Ok(Arc::new(tesseract::TesseractOcrEngine::new(
            tesseract_opts.clone(),
        ))),
        other => Err(anyhow!("unknown OCR engine {:?}", other)),
    }
}

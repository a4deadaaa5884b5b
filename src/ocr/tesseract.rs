//! Tesseract OCR engine.

use std::{
    fs::{File, read_to_string},
    io::Write as _,
};

use tokio::process::Command;

use super::{OcrEngine, OcrPageInput, OcrPageOutput};
use crate::{async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*};

/// Command-line tuning for `tesseract`.
#[derive(Clone, Debug)]
pub struct TesseractOptions {
    /// Language pack, as passed to `-l`.
    pub language: String,
    /// Page segmentation mode. Mode 4 copes well with tabular forms.
    pub psm: u8,
    /// OCR engine mode.
    pub oem: u8,
}

impl Default for TesseractOptions {
    fn default() -> Self {
        Self {
            language: "por".to_owned(),
            psm: 4,
            oem: 3,
        }
    }
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    opts: TesseractOptions,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(opts: TesseractOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(document = %input.document, page = %input.page_idx))]
    async fn ocr_page(&self, input: OcrPageInput) -> Result<OcrPageOutput> {
        let extension = mime_guess::get_mime_extensions_str(&input.page.mime_type)
            .and_then(|o| o.first())
            .ok_or_else(|| {
                anyhow!("cannot determine extension for {}", input.page.mime_type)
            })?;

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join(format!("input.{}", extension));
        let output_path = tmpdir.path().join("output.txt");
        let mut input_file =
            File::create(&input_path).context("cannot create tesseract input file")?;
        input_file
            .write_all(&input.page.data)
            .context("cannot write tesseract input file")?;
        input_file
            .flush()
            .context("cannot flush tesseract input file")?;
        drop(input_file);

        // The page image is on disk now, so release our copy before we wait.
        drop(input.page);

        let output = with_cpu_semaphore(|| async {
            Command::new("tesseract")
                .arg(&input_path)
                .arg(output_path.with_extension(""))
                .arg("-l")
                .arg(&self.opts.language)
                .arg("--psm")
                .arg(self.opts.psm.to_string())
                .arg("--oem")
                .arg(self.opts.oem.to_string())
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        let text =
            read_to_string(&output_path).context("cannot read tesseract output file")?;
        tmpdir.close()?;
        Ok(OcrPageOutput {
            text,
            confidence: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::{Page, PagedDocument as _};

    #[tokio::test]
    async fn pages_without_a_known_extension_fail() {
        let engine = TesseractOcrEngine::new(TesseractOptions::default());
        let input = OcrPageInput {
            document: "scan.pdf".to_owned(),
            page_idx: 0,
            page: Page {
                mime_type: "application/x-not-an-image".to_owned(),
                data: vec![],
            },
        };
        assert!(engine.ocr_page(input).await.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils and tesseract"]
    async fn recognizes_a_rendered_page() -> Result<()> {
        let doc =
            crate::pages::pdf::PdfDocument::open(Path::new("tests/fixtures/two_pages.pdf"), 200)
                .await?;
        let page = doc
            .render_pages(0..1)?
            .pop()
            .ok_or_else(|| anyhow!("no page rendered"))?;
        let engine = TesseractOcrEngine::new(TesseractOptions::default());
        let output = engine
            .ocr_page(OcrPageInput {
                document: "two_pages.pdf".to_owned(),
                page_idx: 0,
                page,
            })
            .await?;
        assert!(output.text.to_uppercase().contains("BANCO"));
        Ok(())
    }
}

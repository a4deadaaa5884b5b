//! PDF documents, rasterized a page range at a time with Poppler.

use std::{collections::BTreeMap, fs, ops::Range, process::Command, sync::LazyLock};

use regex::Regex;

use super::{Page, PagedDocument};
use crate::{async_utils::check_for_command_failure, prelude::*};

/// Poppler reports most problems on stderr, sometimes with a zero exit code.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler complains about damaged cross-reference tables, but recovers.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// A PDF on disk.
///
/// Opening a PDF only counts its pages. Each call to `render_pages` runs
/// `pdftocairo` with `-f`/`-l` so that only the requested range is rasterized,
/// into a scratch directory that is deleted before returning.
pub struct PdfDocument {
    path: PathBuf,
    page_count: usize,
    dpi: u32,
}

impl PdfDocument {
    /// Open a PDF and count its pages.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path, dpi: u32) -> Result<Self> {
        let page_count = get_pdf_page_count(path).await?;
        Ok(Self {
            path: path.to_owned(),
            page_count,
            dpi,
        })
    }
}

impl PagedDocument for PdfDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    fn render_pages(&self, pages: Range<usize>) -> Result<Vec<Page>> {
        if pages.is_empty() {
            return Ok(vec![]);
        }
        if pages.end > self.page_count {
            return Err(anyhow!(
                "page range {:?} out of bounds for {} pages",
                pages,
                self.page_count
            ));
        }

        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_prefix = tmpdir.path().join("page");

        // Poppler uses 1-based, inclusive page numbers.
        let output = Command::new("pdftocairo")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-f")
            .arg((pages.start + 1).to_string())
            .arg("-l")
            .arg(pages.end.to_string())
            .arg(&self.path)
            .arg(&out_prefix)
            .output()
            .with_context(|| format!("failed to run pdftocairo on {:?}", self.path.display()))?;
        check_for_command_failure("pdftocairo", &output, Some(is_error_line))?;

        // Output files are zero-padded, so lexical order is page order.
        let mut paths = tmpdir
            .path()
            .read_dir()
            .context("failed to read rendered pages")?
            .map(|entry| Ok(entry.context("failed to read rendered page entry")?.path()))
            .collect::<Result<Vec<_>>>()?;
        paths.sort();

        let rendered = paths
            .iter()
            .map(|path| {
                let data = fs::read(path)
                    .with_context(|| format!("failed to read {:?}", path.display()))?;
                Ok(Page {
                    mime_type: "image/png".to_owned(),
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let Err(err) = tmpdir.close() {
            warn!("failed to delete rendered pages: {}", err);
        }
        Ok(rendered)
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = tokio::process::Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output)
        .with_context(|| format!("failed to get page count for {:?}", path.display()))
}

/// Pull the `Pages:` property out of `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    pages
        .parse::<usize>()
        .with_context(|| format!("invalid page count {:?}", pages))
}

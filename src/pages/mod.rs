//! Documents as lazily rendered batches of page images.
//!
//! A scanned document may have hundreds of pages, and a rendered page at OCR
//! resolution is several megabytes. So we never render a whole document.
//! Instead, a [`BatchPageSource`] hands out one [`PageBatch`] at a time, and
//! each batch only contains the images for its own page range. Once the caller
//! drops a batch, nothing from it remains reachable.

use std::{fmt, ops::Range, sync::Arc};

use crate::{
    async_utils::blocking::spawn_blocking_propagating_panics, prelude::*,
    upload::StagedDocument,
};

pub mod pdf;
pub mod tiff;

/// Single-image formats that we treat as one-page documents.
const SINGLE_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg"];

/// A rendered page image.
pub struct Page {
    /// The MIME type of `data`.
    pub mime_type: String,
    /// The encoded image.
    pub data: Vec<u8>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A document made of pages that can be rendered a range at a time.
///
/// Implementations must render only the requested pages. `render_pages` is
/// blocking and will be called from Tokio's blocking thread pool.
pub trait PagedDocument: Send + Sync + 'static {
    /// The total number of pages.
    fn page_count(&self) -> usize;

    /// Render the pages in `pages` (0-based, end-exclusive), in order.
    fn render_pages(&self, pages: Range<usize>) -> Result<Vec<Page>>;
}

/// A document could not be opened, or is not a page-structured format we
/// understand.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document {document:?} is unreadable: {reason}")]
    Unreadable { document: String, reason: String },
}

impl DocumentError {
    /// Wrap an arbitrary error as [`DocumentError::Unreadable`].
    pub fn unreadable(document: &str, err: &anyhow::Error) -> Self {
        Self::Unreadable {
            document: document.to_owned(),
            reason: format!("{err:#}"),
        }
    }
}

/// Opens staged uploads as [`PagedDocument`]s.
#[async_trait]
pub trait DocumentOpener: Send + Sync + 'static {
    /// Open a document, failing with [`DocumentError::Unreadable`] if we can't.
    async fn open(
        &self,
        document: &StagedDocument,
    ) -> Result<Arc<dyn PagedDocument>, DocumentError>;
}

/// Options for rendering pages.
#[derive(Clone, Debug)]
pub struct RenderOptions {
    /// DPI used when rasterizing PDFs.
    pub dpi: u32,
}

/// The standard [`DocumentOpener`], which dispatches on the sniffed MIME type.
pub struct FileDocumentOpener {
    options: RenderOptions,
}

impl FileDocumentOpener {
    /// Create a new opener.
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl DocumentOpener for FileDocumentOpener {
    #[instrument(level = "debug", skip_all, fields(document = %document.filename()))]
    async fn open(
        &self,
        document: &StagedDocument,
    ) -> Result<Arc<dyn PagedDocument>, DocumentError> {
        let name = document.filename();
        let path = document.path().to_owned();
        let mime_type = document.mime_type();
        let opened: Result<Arc<dyn PagedDocument>> = match mime_type {
            "application/pdf" => pdf::PdfDocument::open(&path, self.options.dpi)
                .await
                .map(|doc| Arc::new(doc) as Arc<dyn PagedDocument>),
            "image/tiff" => {
                spawn_blocking_propagating_panics(move || tiff::TiffDocument::open(&path))
                    .await
                    .map(|doc| Arc::new(doc) as Arc<dyn PagedDocument>)
            }
            mime if SINGLE_IMAGE_TYPES.contains(&mime) => Ok(Arc::new(ImageDocument {
                path,
                mime_type: mime.to_owned(),
            })),
            other => Err(anyhow!("unsupported document type {}", other)),
        };
        let opened = opened.map_err(|err| DocumentError::unreadable(name, &err))?;
        debug!(pages = opened.page_count(), "Opened document");
        Ok(opened)
    }
}

/// A single PNG or JPEG image, treated as a one-page document.
struct ImageDocument {
    path: PathBuf,
    mime_type: String,
}

impl PagedDocument for ImageDocument {
    fn page_count(&self) -> usize {
        1
    }

    fn render_pages(&self, pages: Range<usize>) -> Result<Vec<Page>> {
        if pages.is_empty() {
            return Ok(vec![]);
        }
        if pages != (0..1) {
            return Err(anyhow!("page range {:?} out of bounds for an image", pages));
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("failed to read image {:?}", self.path.display()))?;
        Ok(vec![Page {
            mime_type: self.mime_type.clone(),
            data,
        }])
    }
}

/// One batch of rendered pages.
#[derive(Debug)]
pub struct PageBatch {
    /// Index of this batch within its document.
    pub index: usize,
    /// Index of the first page in this batch.
    pub first_page: usize,
    /// The rendered pages, in order.
    pub pages: Vec<Page>,
}

/// Splits a [`PagedDocument`] into fixed-size batches.
///
/// Calling [`BatchPageSource::batches`] again restarts from the first batch.
#[derive(Clone)]
pub struct BatchPageSource {
    document: Arc<dyn PagedDocument>,
    batch_size: usize,
}

impl BatchPageSource {
    /// Create a new batch source. `batch_size` must be at least 1.
    pub fn new(document: Arc<dyn PagedDocument>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(anyhow!("batch size must be at least 1"));
        }
        Ok(Self {
            document,
            batch_size,
        })
    }

    /// Total pages in the underlying document.
    pub fn page_count(&self) -> usize {
        self.document.page_count()
    }

    /// How many batches will [`BatchPageSource::batches`] produce?
    pub fn batch_count(&self) -> usize {
        self.page_count().div_ceil(self.batch_size)
    }

    /// The page range covered by batch `index`.
    pub fn batch_range(&self, index: usize) -> Range<usize> {
        let start = (index * self.batch_size).min(self.page_count());
        let end = (start + self.batch_size).min(self.page_count());
        start..end
    }

    /// A fresh iterator over all batches, starting with the first.
    pub fn batches(&self) -> PageBatches {
        PageBatches {
            source: self.clone(),
            next_index: 0,
        }
    }
}

/// Blocking iterator over the batches of a [`BatchPageSource`].
///
/// Rendering happens inside `next`, so only batches that are actually asked
/// for are ever materialized.
pub struct PageBatches {
    source: BatchPageSource,
    next_index: usize,
}

impl Iterator for PageBatches {
    type Item = Result<PageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.source.batch_count() {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;

        let range = self.source.batch_range(index);
        trace!(batch = index, pages = ?range, "Rendering batch");
        let result = self
            .source
            .document
            .render_pages(range.clone())
            .and_then(|pages| {
                if pages.len() == range.len() {
                    Ok(pages)
                } else {
                    Err(anyhow!(
                        "expected {} pages for range {:?}, rendered {}",
                        range.len(),
                        range,
                        pages.len()
                    ))
                }
            })
            .with_context(|| format!("failed to render pages {:?}", range));
        Some(result.map(|pages| PageBatch {
            index,
            first_page: range.start,
            pages,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.source.batch_count().saturating_sub(self.next_index);
        (remaining, Some(remaining))
    }
}

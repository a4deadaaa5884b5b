//! Fakes for exercising the pipeline without Poppler or Tesseract.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    extract::{ExtractionRecord, RecordExtractor, RecordOrigin},
    ocr::{OcrEngine, OcrPageInput, OcrPageOutput},
    pages::{DocumentError, DocumentOpener, Page, PagedDocument},
    prelude::*,
    upload::StagedDocument,
};

/// Counts rendered pages that haven't been recognized yet.
#[derive(Default)]
pub struct PageLedger {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl PageLedger {
    fn rendered(&self, pages: usize) {
        let live = self.live.fetch_add(pages, Ordering::SeqCst) + pages;
        self.peak.fetch_max(live, Ordering::SeqCst);
    }

    fn released(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// The most pages that were ever outstanding at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A document whose pages are tiny placeholder images.
///
/// Clones share their render log and ledger.
#[derive(Clone)]
pub struct FakeDocument {
    page_count: usize,
    failing_render: Option<Range<usize>>,
    rendered: Arc<Mutex<Vec<Range<usize>>>>,
    ledger: Arc<PageLedger>,
}

impl FakeDocument {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            failing_render: None,
            rendered: Arc::default(),
            ledger: Arc::default(),
        }
    }

    /// Fail any render that touches `pages`.
    pub fn failing_render(mut self, pages: Range<usize>) -> Self {
        self.failing_render = Some(pages);
        self
    }

    pub fn ledger(&self) -> Arc<PageLedger> {
        self.ledger.clone()
    }

    pub fn rendered_ranges(&self) -> Vec<Range<usize>> {
        self.rendered.lock().expect("lock poisoned").clone()
    }

    pub fn max_pages_per_render(&self) -> usize {
        self.rendered_ranges()
            .iter()
            .map(|r| r.len())
            .max()
            .unwrap_or(0)
    }
}

impl PagedDocument for FakeDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render_pages(&self, pages: Range<usize>) -> Result<Vec<Page>> {
        if let Some(failing) = &self.failing_render {
            if pages.start < failing.end && failing.start < pages.end {
                return Err(anyhow!("simulated render failure"));
            }
        }
        self.rendered
            .lock()
            .expect("lock poisoned")
            .push(pages.clone());
        self.ledger.rendered(pages.len());
        Ok(pages
            .map(|idx| Page {
                mime_type: "image/png".to_owned(),
                data: format!("page {idx}").into_bytes(),
            })
            .collect())
    }
}

/// Opens [`FakeDocument`]s by file name. Unknown names are unreadable.
#[derive(Default)]
pub struct FakeOpener {
    documents: HashMap<String, FakeDocument>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, name: &str, document: FakeDocument) -> Self {
        self.documents.insert(name.to_owned(), document);
        self
    }
}

#[async_trait]
impl DocumentOpener for FakeOpener {
    async fn open(
        &self,
        document: &StagedDocument,
    ) -> Result<Arc<dyn PagedDocument>, DocumentError> {
        match self.documents.get(document.filename()) {
            Some(fake) => Ok(Arc::new(fake.clone())),
            None => Err(DocumentError::Unreadable {
                document: document.filename().to_owned(),
                reason: "not a document".to_owned(),
            }),
        }
    }
}

/// An OCR engine that returns `RECORD <document> page <n>` for every page,
/// unless told otherwise.
#[derive(Default)]
pub struct ScriptedOcrEngine {
    failing_pages: HashSet<usize>,
    blank_pages: HashSet<usize>,
    panicking_document: Option<String>,
    delay: Option<Duration>,
    ledger: Option<Arc<PageLedger>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedOcrEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail these 0-based pages.
    pub fn failing_pages(mut self, pages: impl IntoIterator<Item = usize>) -> Self {
        self.failing_pages.extend(pages);
        self
    }

    /// Return no text for these 0-based pages.
    pub fn blank_pages(mut self, pages: impl IntoIterator<Item = usize>) -> Self {
        self.blank_pages.extend(pages);
        self
    }

    /// Panic on any page of this document.
    pub fn panicking_on_document(mut self, document: &str) -> Self {
        self.panicking_document = Some(document.to_owned());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Release pages into `ledger` as they are recognized.
    pub fn with_ledger(mut self, ledger: Arc<PageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcrEngine {
    async fn ocr_page(&self, input: OcrPageInput) -> Result<OcrPageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        drop(input.page);
        if let Some(ledger) = &self.ledger {
            ledger.released();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panicking_document.as_deref() == Some(input.document.as_str()) {
            panic!("OCR engine crashed on {}", input.document);
        }
        if self.failing_pages.contains(&input.page_idx) {
            return Err(anyhow!("simulated OCR failure on page {}", input.page_idx));
        }
        let text = if self.blank_pages.contains(&input.page_idx) {
            String::new()
        } else {
            format!("RECORD {} page {}", input.document, input.page_idx + 1)
        };
        Ok(OcrPageOutput {
            text,
            confidence: Some(0.9),
        })
    }
}

/// Relevant if the text mentions `RECORD`; one record per `RECORD` line.
pub struct TaggedLineExtractor;

impl RecordExtractor for TaggedLineExtractor {
    fn is_relevant(&self, text: &str) -> bool {
        text.contains("RECORD")
    }

    fn extract(&self, origin: &RecordOrigin, text: &str) -> Vec<ExtractionRecord> {
        text.lines()
            .filter(|line| line.starts_with("RECORD"))
            .map(|line| {
                let mut record = ExtractionRecord::new(origin);
                record
                    .fields
                    .insert("text".to_owned(), Value::from(line.trim()));
                record
            })
            .collect()
    }
}

/// Stage a small placeholder file named `name` in `dir`.
pub fn staged(dir: &Path, name: &str) -> StagedDocument {
    let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), name));
    std::fs::write(&path, b"%PDF-1.4\n").expect("failed to write staged file");
    StagedDocument::for_tests(name, "application/pdf", &path)
}

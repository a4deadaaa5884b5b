//! OCR and extraction for one batch of pages.

use std::sync::Arc;

use futures::{StreamExt as _, stream};

use crate::{
    extract::{ExtractionRecord, RecordExtractor, RecordOrigin},
    ocr::{OcrEngine, OcrPageInput},
    pages::PageBatch,
    prelude::*,
};

/// A page we couldn't render or recognize.
#[derive(Clone, Debug)]
pub struct PageFailure {
    pub document: String,
    /// 1-based page number.
    pub page: usize,
    pub reason: String,
}

/// Everything one batch produced.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Pages in the batch, including failed ones.
    pub pages: usize,
    pub relevant_pages: usize,
    pub records: Vec<ExtractionRecord>,
    pub failures: Vec<PageFailure>,
}

impl BatchOutcome {
    /// Every page in a batch failed because the batch couldn't be rendered.
    pub fn render_failed(
        document: &str,
        pages: std::ops::Range<usize>,
        err: &anyhow::Error,
    ) -> Self {
        let reason = format!("{err:#}");
        Self {
            pages: pages.len(),
            failures: pages
                .map(|page_idx| PageFailure {
                    document: document.to_owned(),
                    page: page_idx + 1,
                    reason: reason.clone(),
                })
                .collect(),
            ..Self::default()
        }
    }
}

/// Runs the OCR engine and extractor over a batch.
pub struct PageProcessor {
    engine: Arc<dyn OcrEngine>,
    extractor: Arc<dyn RecordExtractor>,
    concurrency: usize,
}

impl PageProcessor {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        extractor: Arc<dyn RecordExtractor>,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            extractor,
            concurrency: concurrency.max(1),
        }
    }

    /// The extractor, for its `finalize` step.
    pub fn extractor(&self) -> &dyn RecordExtractor {
        self.extractor.as_ref()
    }

    /// Process every page in `batch`.
    ///
    /// Up to `concurrency` pages are recognized at once. A page that fails is
    /// logged and recorded in [`BatchOutcome::failures`], and the rest of the
    /// batch carries on. Each page image is handed to the engine by value and
    /// dropped as soon as it has been recognized.
    #[instrument(level = "debug", skip_all, fields(document = %document, batch = batch.index))]
    pub async fn process_batch(&self, document: &str, batch: PageBatch) -> BatchOutcome {
        let first_page = batch.first_page;
        let mut outcome = BatchOutcome {
            pages: batch.pages.len(),
            ..BatchOutcome::default()
        };

        let results = stream::iter(batch.pages.into_iter().enumerate())
            .map(|(offset, page)| {
                let page_idx = first_page + offset;
                let engine = self.engine.clone();
                let input = OcrPageInput {
                    document: document.to_owned(),
                    page_idx,
                    page,
                };
                async move { (page_idx, engine.ocr_page(input).await) }
            })
            .buffered(self.concurrency);
        let mut results = std::pin::pin!(results);

        while let Some((page_idx, result)) = results.next().await {
            let origin = RecordOrigin {
                document: document.to_owned(),
                page: page_idx + 1,
            };
            match result {
                Ok(output) => {
                    if !self.extractor.is_relevant(&output.text) {
                        trace!(page = origin.page, "Skipping irrelevant page");
                        continue;
                    }
                    outcome.relevant_pages += 1;
                    let records = self.extractor.extract(&origin, &output.text);
                    debug!(page = origin.page, records = records.len(), "Extracted records");
                    outcome.records.extend(records);
                }
                Err(err) => {
                    warn!(page = origin.page, "Could not recognize page: {:#}", err);
                    outcome.failures.push(PageFailure {
                        document: origin.document,
                        page: origin.page,
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pages::Page,
        testing::{ScriptedOcrEngine, TaggedLineExtractor},
    };

    fn batch(index: usize, first_page: usize, len: usize) -> PageBatch {
        PageBatch {
            index,
            first_page,
            pages: (0..len)
                .map(|_| Page {
                    mime_type: "image/png".to_owned(),
                    data: vec![0; 16],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn failed_pages_are_skipped_not_fatal() {
        let engine = Arc::new(ScriptedOcrEngine::new().failing_pages([1]));
        let processor = PageProcessor::new(engine, Arc::new(TaggedLineExtractor), 2);
        let outcome = processor.process_batch("a.pdf", batch(0, 0, 3)).await;
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].page, 2);
        let pages = outcome.records.iter().map(|r| r.page).collect::<Vec<_>>();
        assert_eq!(pages, vec![1, 3]);
    }

    #[tokio::test]
    async fn irrelevant_pages_produce_nothing() {
        let engine = Arc::new(ScriptedOcrEngine::new().blank_pages([10, 12]));
        let processor = PageProcessor::new(engine, Arc::new(TaggedLineExtractor), 2);
        let outcome = processor.process_batch("a.pdf", batch(1, 10, 3)).await;
        assert_eq!(outcome.relevant_pages, 1);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].page, 12);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn page_concurrency_is_bounded_and_order_is_kept() {
        let engine = Arc::new(
            ScriptedOcrEngine::new().with_delay(std::time::Duration::from_millis(10)),
        );
        let processor = PageProcessor::new(engine.clone(), Arc::new(TaggedLineExtractor), 3);
        let outcome = processor.process_batch("a.pdf", batch(0, 0, 10)).await;
        assert!(engine.peak_concurrency() <= 3);
        assert_eq!(engine.calls(), 10);
        let pages = outcome.records.iter().map(|r| r.page).collect::<Vec<_>>();
        assert_eq!(pages, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn render_failures_fail_every_page_in_the_batch() {
        let outcome = BatchOutcome::render_failed("a.pdf", 10..13, &anyhow!("bad xref"));
        assert_eq!(outcome.pages, 3);
        let pages = outcome.failures.iter().map(|f| f.page).collect::<Vec<_>>();
        assert_eq!(pages, vec![11, 12, 13]);
        assert!(outcome.records.is_empty());
    }
}

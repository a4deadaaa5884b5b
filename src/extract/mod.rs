//! Turning recognized page text into structured records.
//!
//! The pipeline doesn't know anything about what a record means. It asks a
//! [`RecordExtractor`] whether a page is worth looking at, collects whatever
//! records it produces, and lets it post-process the full list once the job is
//! finished.

use std::collections::BTreeMap;

use schemars::JsonSchema;

use crate::prelude::*;

pub mod bank_details;

pub use self::bank_details::BankDetailsExtractor;

/// Where a record came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordOrigin {
    /// The uploaded file name.
    pub document: String,
    /// 1-based page number.
    pub page: usize,
}

/// One structured record extracted from a page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ExtractionRecord {
    /// The uploaded file name this record was found in.
    pub document: String,

    /// The 1-based page number this record was found on.
    pub page: usize,

    /// Extracted fields. Missing fields are omitted rather than `null`.
    pub fields: BTreeMap<String, Value>,
}

impl ExtractionRecord {
    /// Create an empty record for `origin`.
    pub fn new(origin: &RecordOrigin) -> Self {
        Self {
            document: origin.document.clone(),
            page: origin.page,
            fields: BTreeMap::new(),
        }
    }

    /// Look up a string field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

/// Page-relevance filter plus extraction rules.
pub trait RecordExtractor: Send + Sync + 'static {
    /// Does this page look like it contains anything we can extract?
    fn is_relevant(&self, text: &str) -> bool;

    /// Extract records from a relevant page.
    fn extract(&self, origin: &RecordOrigin, text: &str) -> Vec<ExtractionRecord>;

    /// Post-process all of a job's records, in page order, before they are
    /// published.
    fn finalize(&self, records: Vec<ExtractionRecord>) -> Vec<ExtractionRecord> {
        records
    }
}

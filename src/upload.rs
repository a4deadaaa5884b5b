//! Admission of uploaded documents.
//!
//! Uploads arrive as a stream of chunks. We copy them into a staging file as
//! they arrive, so an upload is never held in memory all at once. The format
//! signature is checked as soon as we have enough header bytes, and the size
//! limit as soon as it is crossed, so bad uploads are rejected without
//! reading the rest.

use std::io;

use tempfile::TempPath;
use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWriteExt as _},
};

use crate::prelude::*;

/// Document formats we accept, by sniffed MIME type.
pub const SUPPORTED_MIME_TYPES: &[&str] =
    &["application/pdf", "image/tiff", "image/png", "image/jpeg"];

/// How many leading bytes we collect before sniffing the format.
const SNIFF_LEN: usize = 16;

/// Read size used when staging local files.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// An upload was rejected before any job was created.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{filename:?} is empty")]
    Empty { filename: String },

    #[error("{filename:?} is not a supported document (detected {})", .detected.as_deref().unwrap_or("unknown format"))]
    UnsupportedFormat {
        filename: String,
        detected: Option<String>,
    },

    #[error("{filename:?} is larger than the {limit} byte limit")]
    TooLarge { filename: String, limit: u64 },

    #[error("no documents were uploaded")]
    NoDocuments,
}

/// Anything that stops us from admitting an upload.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("could not stage upload: {0}")]
    Storage(#[from] io::Error),
}

/// Limits applied to every upload.
#[derive(Clone, Debug)]
pub struct UploadLimits {
    /// Maximum size of a single document, in bytes.
    pub max_bytes: u64,
}

/// A validated document, staged in a temporary file.
///
/// The staged file is deleted when this is dropped, so the job that owns it
/// cleans up after itself however it ends.
#[derive(Debug)]
pub struct StagedDocument {
    filename: String,
    mime_type: &'static str,
    size: u64,
    path: TempPath,
}

impl StagedDocument {
    /// The name the client gave this document.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The sniffed MIME type. Always one of [`SUPPORTED_MIME_TYPES`].
    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path to the staged copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wrap an existing file without validating it. The file will be deleted
    /// on drop.
    #[cfg(test)]
    pub fn for_tests(filename: &str, mime_type: &'static str, path: &Path) -> Self {
        Self {
            filename: filename.to_owned(),
            mime_type,
            size: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            path: TempPath::from_path(path),
        }
    }
}

/// Receives one upload, chunk by chunk.
pub struct UploadSink {
    filename: String,
    limits: UploadLimits,
    file: File,
    path: TempPath,
    size: u64,
    header: Vec<u8>,
    mime_type: Option<&'static str>,
}

impl UploadSink {
    /// Start staging a new upload in `dir`, or the system temp directory.
    pub fn new(
        filename: &str,
        limits: &UploadLimits,
        dir: Option<&Path>,
    ) -> Result<Self, AdmissionError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("upload-");
        let named = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = named.into_parts();
        Ok(Self {
            filename: filename.to_owned(),
            limits: limits.clone(),
            file: File::from_std(file),
            path,
            size: 0,
            header: Vec::with_capacity(SNIFF_LEN),
            mime_type: None,
        })
    }

    /// Append a chunk. Fails as soon as the upload is known to be invalid.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), AdmissionError> {
        self.size += chunk.len() as u64;
        if self.size > self.limits.max_bytes {
            return Err(ValidationError::TooLarge {
                filename: self.filename.clone(),
                limit: self.limits.max_bytes,
            }
            .into());
        }
        if self.mime_type.is_none() {
            let wanted = SNIFF_LEN - self.header.len();
            self.header
                .extend_from_slice(&chunk[..wanted.min(chunk.len())]);
            if self.header.len() >= SNIFF_LEN {
                self.sniff()?;
            }
        }
        self.file.write_all(chunk).await?;
        Ok(())
    }

    /// Finish the upload and hand over the staged document.
    pub async fn finish(mut self) -> Result<StagedDocument, AdmissionError> {
        if self.size == 0 {
            return Err(ValidationError::Empty {
                filename: self.filename,
            }
            .into());
        }
        let mime_type = match self.mime_type {
            Some(mime_type) => mime_type,
            None => self.sniff()?,
        };
        self.file.flush().await?;
        debug!(filename = %self.filename, mime_type, size = self.size, "Staged upload");
        Ok(StagedDocument {
            filename: self.filename,
            mime_type,
            size: self.size,
            path: self.path,
        })
    }

    fn sniff(&mut self) -> Result<&'static str, ValidationError> {
        let detected = infer::get(&self.header).map(|t| t.mime_type());
        match detected {
            Some(mime) if SUPPORTED_MIME_TYPES.contains(&mime) => {
                self.mime_type = Some(mime);
                Ok(mime)
            }
            _ => Err(ValidationError::UnsupportedFormat {
                filename: self.filename.clone(),
                detected: detected.map(str::to_owned),
            }),
        }
    }
}

/// Stage a local file through the same checks as an HTTP upload.
#[instrument(level = "debug", skip(limits))]
pub async fn stage_file(
    path: &Path,
    limits: &UploadLimits,
    dir: Option<&Path>,
) -> Result<StagedDocument, AdmissionError> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut input = File::open(path).await?;
    let mut sink = UploadSink::new(&filename, limits, dir)?;
    let mut buf = vec![0; READ_CHUNK_SIZE];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_chunk(&buf[..n]).await?;
    }
    sink.finish().await
}

//! CLI test cases.
//!
//! Tests that need Poppler and Tesseract installed are marked `#[ignore]`.

use std::{fs, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("ocr-jobs").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_status_report() {
    cmd()
        .arg("schema")
        .arg("StatusReport")
        .assert()
        .success()
        .stdout(predicate::str::contains("progress"));
}

#[test]
fn test_schema_to_file() {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let out = tmpdir.path().join("schema.json");
    cmd()
        .arg("schema")
        .arg("ExtractOutput")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
    let schema = fs::read_to_string(&out).unwrap();
    assert!(schema.contains("job_id"));
}

#[test]
fn test_extract_rejects_text_renamed_to_pdf() {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let input = tmpdir.path().join("notes.pdf");
    fs::write(&input, "just some plain text, not a PDF at all\n").unwrap();
    cmd()
        .arg("extract")
        .arg(&input)
        .arg("--upload-dir")
        .arg(tmpdir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a supported document"));
}

#[test]
fn test_extract_rejects_empty_file() {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let input = tmpdir.path().join("empty.pdf");
    fs::write(&input, "").unwrap();
    cmd()
        .arg("extract")
        .arg(&input)
        .arg("--upload-dir")
        .arg(tmpdir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn test_extract_rejects_zero_workers() {
    cmd()
        .arg("extract")
        .arg("tests/fixtures/two_pages.pdf")
        .arg("--workers")
        .arg("0")
        .assert()
        .failure();
}

#[test]
#[ignore = "Requires poppler-utils and tesseract"]
fn test_extract_pdf() {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let out = tmpdir.path().join("out.jsonl");
    cmd()
        .arg("extract")
        .arg("tests/fixtures/two_pages.pdf")
        .arg("--batch-size")
        .arg("1")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
    let output = fs::read_to_string(&out).unwrap();
    assert!(output.contains("\"status\":\"done\""));
    assert!(output.contains("two_pages.pdf"));
}

//! Asynchronous utilities for use with Tokio.
//!
//! The job pipeline mixes three kinds of work: async bookkeeping, blocking
//! page rendering, and external OCR processes. The glue for all three lives
//! here so the rest of the crate can stay straightforward.

use std::{pin::Pin, process::Output};

use futures::Stream;

use crate::prelude::*;

pub mod blocking;
pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at `debug` level. If
/// `is_error_line` is supplied, a successful exit whose standard error contains
/// a matching line is still treated as a failure. Poppler in particular likes
/// to exit 0 after printing "Syntax Error" for damaged files.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stdout, "Standard output from command");
    if !stderr.trim().is_empty() {
        debug!(command_name, output = %stderr, "Standard error from command");
    }

    if output.status.success() {
        match is_error_line {
            Some(is_error_line) if stderr.lines().any(is_error_line) => Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            )),
            _ => Ok(()),
        }
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} was killed by a signal, with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    fn run_sh(script: &str) -> Output {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .output()
            .expect("sh should be available")
    }

    #[test]
    fn successful_command_passes() {
        let output = run_sh("echo hello");
        assert!(check_for_command_failure("sh", &output, None).is_ok());
    }

    #[test]
    fn non_zero_exit_fails_with_stderr() {
        let output = run_sh("echo broken >&2; exit 3");
        let err = check_for_command_failure("sh", &output, None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    #[test]
    fn error_lines_fail_successful_commands() {
        let output = run_sh("echo 'Syntax Error: bad xref' >&2");
        let is_error = |line: &str| line.contains("Error");
        assert!(check_for_command_failure("sh", &output, Some(is_error)).is_err());
        assert!(check_for_command_failure("sh", &output, None).is_ok());
    }
}

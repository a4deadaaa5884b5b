use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod extract;
mod jobs;
mod ocr;
mod pages;
mod prelude;
mod server;
#[cfg(test)]
mod testing;
mod ui;
mod upload;

/// Batched OCR jobs for large scanned documents.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  Every option can also be set with an OCR_JOBS_* environment
  variable, as shown in each subcommand's help.

  RUST_LOG controls log output (default: info).

  These variables may be set in a standard `.env` file.

External Tools:
  pdfinfo and pdftocairo (Poppler) for PDFs, and tesseract
  for text recognition, must be on the PATH.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the HTTP service: upload documents, poll status, fetch results.
    Serve(cmd::serve::ServeOpts),
    /// Run local documents through the job pipeline and write JSONL results.
    Extract(cmd::extract::ExtractOpts),
    /// Print schemas for output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Serve(_) => false,
            Cmd::Extract(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists. This must
    // happen before parsing, because options can come from the environment.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Serve(serve_opts) => cmd::serve::cmd_serve(serve_opts).await,
        Cmd::Extract(extract_opts) => cmd::extract::cmd_extract(ui, extract_opts).await,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await,
    }
}

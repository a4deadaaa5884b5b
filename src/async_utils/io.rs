//! Output helpers for the command-line subcommands.
//!
//! Results go either to a file or to standard output, one JSON document per
//! line, so they can be piped into `jq` or loaded as JSONL.

use futures::{StreamExt as _, pin_mut};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use super::BoxedStream;
use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of serializable values to a file or stdout as JSONL.
pub async fn write_jsonl<T>(path: Option<&Path>, stream: BoxedStream<Result<T>>) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let value = value?;
        let json = serde_json::to_string(&value).context("Failed to serialize output record")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

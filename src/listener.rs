//! Result listeners and the built-in results-file writer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::error::ListenerError;
use crate::sample::SampleResult;

/// Consumer of completed sample results.
///
/// Every result is delivered synchronously on the producing virtual user, in
/// completion order for that user; results from different users interleave
/// arbitrarily. Implementations are shared across users and must tolerate
/// concurrent `handle` calls.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Name used in warnings and error reports.
    fn name(&self) -> &str;

    /// Process one completed result.
    async fn handle(&self, result: &SampleResult) -> Result<(), ListenerError>;

    /// Flush and release resources once the owning scope has finished.
    async fn close(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

const FIELD_HEADER: &str =
    "timeStamp,elapsed,label,responseCode,responseMessage,threadName,success,bytes,sentBytes";

/// Streaming results-file writer (JTL-style delimited text).
///
/// Writes one header line naming the fields, then one line per received
/// result in arrival order. Concurrent writes are serialized through a lock
/// so lines from different virtual users never interleave mid-line.
pub struct JtlWriter {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl JtlWriter {
    /// Creates (or truncates) the target file and writes the header line.
    pub(crate) async fn open(path: &Path) -> std::io::Result<Self> {
        let mut out = BufWriter::new(File::create(path).await?);
        out.write_all(FIELD_HEADER.as_bytes()).await?;
        out.write_all(b"\n").await?;
        Ok(Self {
            path: path.to_owned(),
            out: Mutex::new(out),
        })
    }

    fn format_line(result: &SampleResult) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}\n",
            result.start_millis,
            result.elapsed.as_millis(),
            csv_escape(&result.label),
            result.response_code(),
            csv_escape(result.response_message()),
            csv_escape(&result.thread_name),
            result.success,
            result.bytes_received,
            result.bytes_sent,
        )
    }
}

#[async_trait]
impl Listener for JtlWriter {
    fn name(&self) -> &str {
        self.path.to_str().unwrap_or("results file")
    }

    async fn handle(&self, result: &SampleResult) -> Result<(), ListenerError> {
        let line = Self::format_line(result);
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        let mut out = self.out.lock().await;
        out.flush().await?;
        Ok(())
    }
}

/// Wraps a field in quotes when it contains the delimiter, a quote, or a
/// newline, doubling embedded quotes.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

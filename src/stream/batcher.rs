// Stream batcher — groups newline-delimited JSON records into batches.
//
// The source is a file being appended to (or stdin). When it runs dry the
// batcher hands back whatever it has; with nothing accumulated it sleeps for
// the poll interval and looks again, so a batch is never empty. A line
// without its trailing newline is a record still being written: it stays
// buffered until the rest arrives.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::scheduler::Sleeper;

/// Boxed input source, either a file or stdin.
pub type InputReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Open the input: the file at `path` (read from the start, later appends are
/// picked up), or stdin when no path is given.
pub async fn open_input(path: Option<&Path>) -> Result<InputReader> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input file {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

pub struct StreamBatcher<R, T> {
    reader: R,
    batch_size: usize,
    poll_interval: Duration,
    sleeper: Arc<dyn Sleeper>,
    /// Bytes of a line whose newline hasn't arrived yet.
    partial: String,
    _record: PhantomData<fn() -> T>,
}

impl<R, T> StreamBatcher<R, T>
where
    R: AsyncBufRead + Unpin + Send,
    T: DeserializeOwned,
{
    /// A batch size of zero is treated as one.
    pub fn new(
        reader: R,
        batch_size: usize,
        poll_interval: Duration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            reader,
            batch_size: batch_size.max(1),
            poll_interval,
            sleeper,
            partial: String::new(),
            _record: PhantomData,
        }
    }

    /// Next complete line, or `None` if the source has nothing more right now.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_line(&mut self.partial).await?;
        if read == 0 || !self.partial.ends_with('\n') {
            // Nothing new, or a record cut off mid-write: keep what we have.
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.partial)))
    }

    fn parse(line: &str) -> Option<T> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, line, "Dropping unparseable record");
                None
            }
        }
    }

    /// Wait for and return the next non-empty batch of at most `batch_size`
    /// records.
    pub async fn next_batch(&mut self) -> Vec<T> {
        let mut batch = Vec::with_capacity(self.batch_size);

        loop {
            match self.next_line().await {
                Ok(Some(line)) => {
                    if let Some(record) = Self::parse(&line) {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            return batch;
                        }
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to read input"),
            }

            if !batch.is_empty() {
                return batch;
            }
            debug!(
                sleep_ms = self.poll_interval.as_millis() as u64,
                "Input exhausted, sleeping"
            );
            self.sleeper.sleep(self.poll_interval).await;
        }
    }

    /// The batcher as an endless stream of batches.
    pub fn into_stream(self) -> impl Stream<Item = Vec<T>> {
        stream::unfold(self, |mut batcher| async move {
            let batch = batcher.next_batch().await;
            Some((batch, batcher))
        })
    }
}

//! Streaming a compressed type file into a bulk-copy channel.
//!
//! The channel may refuse a chunk while it is saturated. That is flow control,
//! not failure: the pump first yields so a drain running on the same task can
//! catch up, then sleeps for [`BackpressurePolicy::pause`] and offers the same
//! chunk again, giving up only after [`BackpressurePolicy::max_retries`]
//! pauses for one chunk.
//!
//! [`pump_gzip_file`] wires the pump to a [`CopySink`] through a bounded
//! queue and runs both ends together.

use crate::error::LoadError;
use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Size of the decompressed chunks handed to the channel.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Answer of a [`CopyChannel`] to one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    /// The channel is full; the chunk is handed back to be offered again.
    Busy(Vec<u8>),
}

/// The sending half of a bulk-copy transfer.
pub trait CopyChannel {
    /// Offers one chunk without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer has been torn down.
    fn put_copy_data(&mut self, chunk: Vec<u8>) -> Result<PutOutcome, LoadError>;
}

/// A bounded in-process queue whose receiver feeds the database copy stream.
#[derive(Debug)]
pub struct QueueChannel {
    table: String,
    sender: mpsc::Sender<Vec<u8>>,
}

impl QueueChannel {
    pub fn new(table: impl Into<String>, sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            table: table.into(),
            sender,
        }
    }
}

impl CopyChannel for QueueChannel {
    fn put_copy_data(&mut self, chunk: Vec<u8>) -> Result<PutOutcome, LoadError> {
        match self.sender.try_send(chunk) {
            Ok(()) => Ok(PutOutcome::Accepted),
            Err(mpsc::error::TrySendError::Full(chunk)) => Ok(PutOutcome::Busy(chunk)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LoadError::ChannelClosed {
                table: self.table.clone(),
            }),
        }
    }
}

/// How long to wait for a saturated channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressurePolicy {
    /// Refusals answered by yielding to other work before each pause
    pub yields_before_pause: u32,
    pub pause: Duration,
    pub max_retries: u32,
}

impl Default for BackpressurePolicy {
    /// 100 ms pauses, giving up after five minutes of refusals for one chunk.
    fn default() -> Self {
        Self {
            yields_before_pause: 4,
            pause: Duration::from_millis(100),
            max_retries: 3_000,
        }
    }
}

/// What was pushed through the channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyProgress {
    /// Decompressed bytes sent
    pub bytes: u64,
    /// Newline-terminated lines sent, header included
    pub lines: u64,
    pub chunks: u64,
    /// Pauses taken while the channel was busy
    pub busy_retries: u64,
}

impl CopyProgress {
    /// Data rows sent, i.e. lines minus the header line.
    pub fn data_rows(&self) -> u64 {
        self.lines.saturating_sub(1)
    }
}

/// Offers `chunk` until the channel accepts it or the policy runs out.
async fn put_with_backpressure<C>(
    channel: &mut C,
    mut chunk: Vec<u8>,
    table: &str,
    policy: &BackpressurePolicy,
    progress: &mut CopyProgress,
) -> Result<(), LoadError>
where
    C: CopyChannel + Send + ?Sized,
{
    let mut attempts = 0u32;
    let mut yields = 0u32;

    loop {
        match channel.put_copy_data(chunk)? {
            PutOutcome::Accepted => return Ok(()),
            PutOutcome::Busy(returned) => {
                chunk = returned;
                if yields < policy.yields_before_pause {
                    yields += 1;
                    tokio::task::yield_now().await;
                    continue;
                }

                yields = 0;
                attempts += 1;
                if attempts > policy.max_retries {
                    return Err(LoadError::Backpressure {
                        table: table.to_string(),
                        attempts,
                    });
                }
                trace!(table, attempts, "Copy channel busy, retrying");
                progress.busy_retries += 1;
                tokio::time::sleep(policy.pause).await;
            }
        }
    }
}

/// Streams a gzip file into `channel` in [`COPY_CHUNK_SIZE`] pieces.
///
/// The caller signals end-of-data (e.g. by dropping the channel) and collects
/// the transfer status afterwards.
///
/// # Errors
///
/// * [`LoadError::Io`] if the file cannot be opened or decompressed
/// * [`LoadError::Backpressure`] if the channel stays busy too long
/// * any error the channel reports
pub async fn stream_gzip_file<C>(
    path: &Path,
    table: &str,
    channel: &mut C,
    policy: &BackpressurePolicy,
) -> Result<CopyProgress, LoadError>
where
    C: CopyChannel + Send + ?Sized,
{
    let io_error = |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_error)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    let mut progress = CopyProgress::default();
    let mut last_byte = None;

    loop {
        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        let filled = read_full(&mut decoder, &mut chunk).map_err(io_error)?;
        if filled == 0 {
            break;
        }
        chunk.truncate(filled);

        progress.bytes += filled as u64;
        progress.lines += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
        progress.chunks += 1;
        last_byte = chunk.last().copied();

        put_with_backpressure(channel, chunk, table, policy, &mut progress).await?;
    }

    // An unterminated final line still counts.
    if last_byte.is_some_and(|b| b != b'\n') {
        progress.lines += 1;
    }

    debug!(
        table,
        path = %path.display(),
        bytes = progress.bytes,
        lines = progress.lines,
        busy_retries = progress.busy_retries,
        "Finished streaming copy data"
    );

    Ok(progress)
}

/// The receiving end of a bulk copy, e.g. a database `COPY ... FROM STDIN`.
#[async_trait]
pub trait CopySink: Send + Sized {
    /// What the sink reports once all data is in, such as a row count.
    type Output: Send;

    async fn send_chunk(&mut self, chunk: Vec<u8>) -> Result<(), LoadError>;

    /// Ends the transfer and waits for its result.
    async fn finish(self) -> Result<Self::Output, LoadError>;
}

/// Streams a gzip file into `sink` through a queue of `depth` chunks.
///
/// Reading and sending run concurrently on the current task. Once the file
/// is exhausted the queue is closed, the sink drains what is left and is
/// finished. If either side fails the first error is returned and the sink
/// is dropped without being finished.
pub async fn pump_gzip_file<S: CopySink>(
    path: &Path,
    table: &str,
    sink: S,
    policy: &BackpressurePolicy,
    depth: usize,
) -> Result<(CopyProgress, S::Output), LoadError> {
    let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(depth.max(1));
    let mut channel = QueueChannel::new(table, sender);

    let produce = async move {
        let progress = stream_gzip_file(path, table, &mut channel, policy).await;
        // Dropping the sender ends the drain loop below.
        drop(channel);
        progress
    };

    let drain = async move {
        let mut sink = sink;
        while let Some(chunk) = receiver.recv().await {
            sink.send_chunk(chunk).await?;
        }
        sink.finish().await
    };

    tokio::try_join!(produce, drain)
}

/// Reads until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

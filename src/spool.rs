//! Spool: a disk-backed append/tail buffer decoupling one producer from one
//! sequential reader (§4.5).
//!
//! Records are written as newline-delimited JSON to a uniquely-named temp
//! file. The reader tails the same file in fixed-size chunks, carrying a
//! partial trailing line across chunk boundaries, and waits on a
//! [`tokio::sync::Notify`] permit rather than a real filesystem watch: spool
//! producer and consumer always live in the same process here, so a kernel
//! inotify/FSEvents watch would add a syscall round-trip for no benefit over
//! the writer simply notifying its one reader directly.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::Stream;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::SourceError;

/// Writes are flushed (and the reader notified) once this many bytes have
/// been buffered.
const WRITE_BUFFER_THRESHOLD: usize = 64 * 1024;

/// The reader pulls this many bytes per underlying file read.
const READ_CHUNK_SIZE: usize = 512 * 1024;

/// An append-only, newline-delimited-JSON disk buffer for a single shard.
pub struct Spool {
    path: PathBuf,
    done: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
    processed: AtomicBool,
}

impl Spool {
    /// Create a spool backed by a uniquely-named file under `dir`. The file
    /// is created (empty) immediately so a concurrently-starting reader
    /// never races the writer's file creation.
    pub fn new(dir: &Path) -> Result<Self, SourceError> {
        let path = dir.join(format!("spool-{}.ndjson", uuid::Uuid::new_v4()));
        std::fs::File::create(&path)?;
        Ok(Self {
            path,
            done: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(tokio::sync::Notify::new()),
            processed: AtomicBool::new(false),
        })
    }

    /// Write every item of `records` to the spool file, then mark it done.
    ///
    /// On a producer error, the spool is still marked done (so the reader
    /// can drain what was written and stop waiting) and `cancel` is
    /// signalled so the owning controller aborts promptly.
    pub async fn start<S>(&self, mut records: S, cancel: &CancellationToken) -> Result<(), SourceError>
    where
        S: Stream<Item = Result<Value, SourceError>> + Unpin,
    {
        use futures_util::StreamExt;

        let file = File::create(&self.path).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_THRESHOLD, file);
        let mut unflushed = 0usize;

        let result: Result<(), SourceError> = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(SourceError::Cancelled),
                next = records.next() => {
                    match next {
                        None => break Ok(()),
                        Some(Err(e)) => break Err(e),
                        Some(Ok(record)) => {
                            let mut line = serde_json::to_vec(&record)?;
                            line.push(b'\n');
                            unflushed += line.len();
                            writer.write_all(&line).await?;
                            if unflushed >= WRITE_BUFFER_THRESHOLD {
                                writer.flush().await?;
                                unflushed = 0;
                                self.notify.notify_one();
                                trace!(path = %self.path.display(), "spool flushed write buffer");
                            }
                        }
                    }
                }
            }
        };

        let _ = writer.flush().await;
        self.done.store(true, Ordering::Release);
        self.notify.notify_one();

        if result.is_err() {
            cancel.cancel();
        }
        debug!(path = %self.path.display(), ok = result.is_ok(), "spool writer finished");
        result
    }

    /// Consume the spool's contents as a stream of decoded JSON records,
    /// reading fixed-size chunks and splitting on newlines. May only be
    /// called once per spool. Takes `Arc<Self>` rather than `&self` so the
    /// returned stream is `'static` and can be held by a caller across
    /// `.await` points without re-borrowing the spool each time (the
    /// orchestrator persists one reader per shard across many poll calls).
    ///
    /// # Panics
    /// Panics if called more than once on the same spool.
    pub fn process(self: Arc<Self>) -> impl Stream<Item = Result<Value, SourceError>> + 'static {
        assert!(
            !self.processed.swap(true, Ordering::AcqRel),
            "Spool::process called more than once"
        );

        futures_util::stream::unfold(
            (
                self,
                ReadState {
                    file: None,
                    buf: Vec::new(),
                    partial: Vec::new(),
                    eof_no_more_data: false,
                },
            ),
            move |(this, mut state)| async move {
                loop {
                    if let Some(record) = state.take_line()? {
                        return Some((record, (this, state)));
                    }
                    if state.eof_no_more_data {
                        if !state.partial.is_empty() {
                            let line = std::mem::take(&mut state.partial);
                            return Some((decode_line(&line), (this, state)));
                        }
                        return None;
                    }

                    if state.file.is_none() {
                        match File::open(&this.path).await {
                            Ok(f) => state.file = Some(f),
                            Err(e) => return Some((Err(SourceError::from(e)), (this, state))),
                        }
                    }
                    let file = state.file.as_mut().unwrap();

                    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
                    let n = match file.read(&mut chunk).await {
                        Ok(n) => n,
                        Err(e) => return Some((Err(SourceError::from(e)), (this, state))),
                    };

                    if n == 0 {
                        if this.done.load(Ordering::Acquire) {
                            state.eof_no_more_data = true;
                        } else {
                            this.notify.notified().await;
                        }
                        continue;
                    }

                    chunk.truncate(n);
                    state.buf.extend_from_slice(&chunk);
                }
            },
        )
    }

    /// Remove the spool file. Idempotent: a missing file is not an error.
    pub async fn cleanup(&self) -> Result<(), SourceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SourceError::from(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct ReadState {
    file: Option<File>,
    buf: Vec<u8>,
    partial: Vec<u8>,
    eof_no_more_data: bool,
}

impl ReadState {
    /// Pull one complete newline-terminated line out of `buf`, prepending
    /// any previously carried partial line. Returns `None` when no full
    /// line is currently available (not an error: the caller should read
    /// more or, at EOF, flush the remaining partial).
    fn take_line(&mut self) -> Option<Option<Result<Value, SourceError>>> {
        split_one_line(&mut self.buf, &mut self.partial).map(|line| Some(decode_line(&line)))
    }
}

/// Pull one complete newline-terminated line (newline dropped) out of
/// `buf`, prepending and clearing any previously carried `partial` line.
/// Leaves any remaining partial trailing data in `partial` for the next
/// call. Exposed standalone so the chunk-boundary reassembly logic can be
/// exercised without a file or a runtime.
pub fn split_one_line(buf: &mut Vec<u8>, partial: &mut Vec<u8>) -> Option<Vec<u8>> {
    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line = buf.drain(..=pos).collect::<Vec<u8>>();
        line.pop();
        if !partial.is_empty() {
            let mut full = std::mem::take(partial);
            full.extend_from_slice(&line);
            return Some(full);
        }
        return Some(line);
    }
    if !buf.is_empty() {
        partial.extend_from_slice(buf);
        buf.clear();
    }
    None
}

fn decode_line(line: &[u8]) -> Result<Value, SourceError> {
    serde_json::from_slice(line).map_err(SourceError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use serde_json::json;

    #[tokio::test]
    async fn writes_then_reads_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(Spool::new(dir.path()).unwrap());
        let cancel = CancellationToken::new();

        let records = stream::iter(vec![Ok(json!({"id": 1})), Ok(json!({"id": 2}))]);
        spool.start(records, &cancel).await.unwrap();

        let out: Vec<_> = spool.clone().process().collect().await;
        let values: Vec<Value> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![json!({"id": 1}), json!({"id": 2})]);

        spool.cleanup().await.unwrap();
        assert!(!spool.path().exists());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path()).unwrap();
        spool.cleanup().await.unwrap();
        spool.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_write_and_read_drains_everything() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(Spool::new(dir.path()).unwrap());
        let cancel = CancellationToken::new();

        let writer_spool = spool.clone();
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            let records = stream::iter((0..50).map(|i| Ok(json!({ "id": i }))));
            writer_spool.start(records, &writer_cancel).await.unwrap();
        });

        let out: Vec<_> = spool.clone().process().collect().await;
        writer.await.unwrap();

        assert_eq!(out.len(), 50);
        for (i, r) in out.into_iter().enumerate() {
            assert_eq!(r.unwrap()["id"], i as i64);
        }
    }

    #[tokio::test]
    async fn producer_error_marks_done_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(Spool::new(dir.path()).unwrap());
        let cancel = CancellationToken::new();

        let records = stream::iter(vec![
            Ok(json!({"id": 1})),
            Err(SourceError::NonFatal("boom".into())),
        ]);
        let result = spool.start(records, &cancel).await;
        assert!(result.is_err());
        assert!(cancel.is_cancelled());

        let out: Vec<_> = spool.process().collect().await;
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn split_one_line_carries_a_partial_line_across_calls() {
        let mut partial = Vec::new();

        let mut buf = b"hel".to_vec();
        assert_eq!(split_one_line(&mut buf, &mut partial), None);
        assert_eq!(partial, b"hel");

        let mut buf = b"lo\nworld".to_vec();
        assert_eq!(split_one_line(&mut buf, &mut partial), Some(b"hello".to_vec()));
        assert_eq!(partial, Vec::<u8>::new());
        assert_eq!(buf, b"world");
        assert_eq!(split_one_line(&mut buf, &mut partial), None);
        assert_eq!(partial, b"world");
    }

    #[tokio::test]
    #[should_panic(expected = "called more than once")]
    async fn process_may_only_be_called_once() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(Spool::new(dir.path()).unwrap());
        let _first = spool.clone().process();
        let _second = spool.process();
    }
}

//! Reusable producer workers.
//!
//! Each copy submits one read job: the worker pulls bytes from the source
//! into its own buffer and publishes them through the job's `ByteChannel`
//! while the caller's thread drains and writes. Workers are started once per
//! pool and serve every file of an operation.
//!
//! A job owns its source for the duration of the read. Archive entries travel
//! as the whole `ZipArchive` plus an index so the entry reader is created on
//! the worker thread; the outcome hands the source back to the caller.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};
use zip::ZipArchive;

use crate::channel::{ByteChannel, CancelToken};
use crate::error::EngineError;

/// What a producer reads from.
pub(crate) enum ReadSource {
    File(File),
    Entry {
        archive: ZipArchive<File>,
        index: usize,
    },
}

/// Result of one read job, returned with the source it borrowed.
pub(crate) struct ReadOutcome {
    pub source: ReadSource,
    pub result: io::Result<u64>,
}

struct ReadJob {
    source: ReadSource,
    channel: Arc<ByteChannel>,
    cancel: CancelToken,
    reply: Sender<ReadOutcome>,
}

pub struct ReaderPool {
    jobs: Option<Sender<ReadJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl ReaderPool {
    /// Start `threads` producer workers (at least one).
    ///
    /// # Errors
    /// Returns EngineError::Config if a worker thread cannot be spawned
    pub fn new(threads: usize) -> Result<Self, EngineError> {
        let (job_tx, job_rx) = unbounded::<ReadJob>();
        let mut workers = Vec::new();

        for worker_id in 0..threads.max(1) {
            let rx = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("save-reader-{}", worker_id))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let ReadJob {
                            mut source,
                            channel,
                            cancel,
                            reply,
                        } = job;
                        let result = produce(&mut source, &channel, &cancel);
                        trace!(worker = worker_id, ok = result.is_ok(), "read job finished");
                        let _ = reply.send(ReadOutcome { source, result });
                    }
                })
                .map_err(|e| EngineError::Config(format!("cannot start reader thread: {}", e)))?;
            workers.push(handle);
        }

        debug!(threads = workers.len(), "reader pool started");
        Ok(ReaderPool {
            jobs: Some(job_tx),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a read of `source` into `channel`.
    ///
    /// The returned receiver yields exactly one outcome once the producer has
    /// finished the stream. If no worker accepts the job the source is
    /// handed straight back.
    pub(crate) fn submit(
        &self,
        source: ReadSource,
        channel: Arc<ByteChannel>,
        cancel: CancelToken,
    ) -> Result<Receiver<ReadOutcome>, ReadSource> {
        let (reply, outcome) = bounded(1);
        let job = ReadJob {
            source,
            channel,
            cancel,
            reply,
        };
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|e| e.into_inner().source)?,
            None => return Err(job.source),
        }
        Ok(outcome)
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        // Closing the job queue ends every worker loop.
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn produce(source: &mut ReadSource, channel: &ByteChannel, cancel: &CancelToken) -> io::Result<u64> {
    let _guard = channel.producer_guard();
    match source {
        ReadSource::File(file) => pump(file, channel, cancel),
        ReadSource::Entry { archive, index } => {
            let mut entry = archive.by_index(*index).map_err(io::Error::other)?;
            pump(&mut entry, channel, cancel)
        }
    }
}

/// Read until EOF, publishing one payload per read. Stops quietly when the
/// consumer closes the channel.
fn pump<R: Read>(reader: &mut R, channel: &ByteChannel, cancel: &CancelToken) -> io::Result<u64> {
    let mut buffer = Vec::with_capacity(channel.capacity());
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "read cancelled"));
        }

        buffer.resize(channel.capacity(), 0);
        let read = loop {
            match reader.read(&mut buffer) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if read == 0 {
            break;
        }

        buffer.truncate(read);
        total += read as u64;
        if !channel.put(&mut buffer) {
            break;
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn drain(channel: &ByteChannel) -> Vec<u8> {
        let _guard = channel.consumer_guard();
        let mut received = Vec::new();
        let mut buffer = Vec::new();
        while channel.take(&mut buffer).is_some() {
            received.extend_from_slice(&buffer);
        }
        received
    }

    #[test]
    fn test_pool_reads_file_and_returns_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).expect("Failed to write source");

        let pool = ReaderPool::new(1).expect("Failed to start pool");
        for _ in 0..3 {
            let channel = Arc::new(ByteChannel::new(1024));
            let file = File::open(&path).expect("Failed to open source");
            let outcome = pool
                .submit(ReadSource::File(file), Arc::clone(&channel), CancelToken::new())
                .unwrap_or_else(|_| panic!("Pool rejected job"));

            assert_eq!(drain(&channel), data);
            let outcome = outcome.recv().expect("Failed to receive outcome");
            assert_eq!(outcome.result.expect("Read failed"), data.len() as u64);
            assert!(matches!(outcome.source, ReadSource::File(_)));
        }
        assert_eq!(pool.threads(), 1);
    }

    #[test]
    fn test_empty_file_finishes_immediately() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("empty.bin");
        fs::write(&path, b"").expect("Failed to write source");

        let pool = ReaderPool::new(2).expect("Failed to start pool");
        let channel = Arc::new(ByteChannel::new(64));
        let file = File::open(&path).expect("Failed to open source");
        let outcome = pool
            .submit(ReadSource::File(file), Arc::clone(&channel), CancelToken::new())
            .unwrap_or_else(|_| panic!("Pool rejected job"));

        assert!(drain(&channel).is_empty());
        assert_eq!(outcome.recv().expect("Failed to receive outcome").result.expect("Read failed"), 0);
    }

    #[test]
    fn test_cancelled_job_reports_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, vec![1u8; 4096]).expect("Failed to write source");

        let pool = ReaderPool::new(1).expect("Failed to start pool");
        let cancel = CancelToken::new();
        cancel.cancel();
        let channel = Arc::new(ByteChannel::new(64));
        let file = File::open(&path).expect("Failed to open source");
        let outcome = pool
            .submit(ReadSource::File(file), Arc::clone(&channel), cancel)
            .unwrap_or_else(|_| panic!("Pool rejected job"));

        assert!(drain(&channel).is_empty());
        assert!(outcome.recv().expect("Failed to receive outcome").result.is_err());
    }
}

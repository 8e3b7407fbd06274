//! Durable buffered writer: unbounded queue, one consumer thread, rotation.
//!
//! Producers enqueue records without blocking; a dedicated thread owns the
//! output file and is the only writer. A failure to serialize or persist a
//! record is unrecoverable for the run: the writer trips the shared
//! cancellation token so the whole pipeline winds down, then discards the
//! backlog so shutdown can complete. Records that were accepted before a
//! clean [`close`](BufferedWriter::close) are never dropped.

use crate::config::WriterOptions;
use crate::error::{Error, Result};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a writer puts its records.
#[derive(Debug, Clone)]
pub enum WriterTarget {
    /// One file at a fixed path, appended across runs. Rotation is ignored.
    Stable(PathBuf),
    /// Timestamped files under `dir`, rotated every
    /// `max_records_per_file` records.
    Rotating {
        dir: PathBuf,
        prefix: String,
        extension: String,
    },
}

/// Turns a record into one output line, without the trailing newline.
/// An `Err` is fatal for the run.
pub type Serializer<T> = Box<dyn Fn(&T) -> std::result::Result<String, String> + Send>;

/// Generic durable writer over an unbounded channel and one consumer thread.
pub struct BufferedWriter<T> {
    name: String,
    sender: Option<Sender<T>>,
    pending: Arc<AtomicUsize>,
    fatal: Arc<AtomicBool>,
    cancel: CancellationToken,
    options: WriterOptions,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> BufferedWriter<T> {
    /// Start the consumer thread. `header`, when given, opens every file.
    pub fn new(
        name: impl Into<String>,
        target: WriterTarget,
        header: Option<String>,
        serializer: Serializer<T>,
        options: WriterOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let name = name.into();
        match &target {
            WriterTarget::Stable(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
            WriterTarget::Rotating { dir, .. } => fs::create_dir_all(dir)?,
        }

        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let fatal = Arc::new(AtomicBool::new(false));

        let consumer = Consumer {
            name: name.clone(),
            target,
            header,
            serializer,
            max_records_per_file: options.max_records_per_file,
            pending: Arc::clone(&pending),
            fatal: Arc::clone(&fatal),
            cancel: cancel.clone(),
            current: None,
            records_in_file: 0,
            file_seq: 0,
        };
        let handle = std::thread::Builder::new()
            .name(format!("writer-{name}"))
            .spawn(move || consumer.run(receiver))?;

        Ok(Self {
            name,
            sender: Some(sender),
            pending,
            fatal,
            cancel,
            options,
            handle: Some(handle),
        })
    }

    /// Accept a record for persistence. Never blocks; the queue is
    /// unbounded. Fails only when the writer has already failed fatally or
    /// its consumer is gone.
    pub fn enqueue(&self, record: T) -> Result<()> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(Error::WriterClosed(self.name.clone()));
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::WriterClosed(self.name.clone()))?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(record).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            Error::WriterClosed(self.name.clone())
        })
    }

    /// Records accepted but not yet persisted.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer could close right now without waiting.
    pub fn can_close(&self) -> bool {
        self.pending() == 0
    }

    /// Stop accepting records, wait for the backlog to drain, and join the
    /// consumer.
    ///
    /// Under cancellation the wait is bounded: after `close_grace_polls`
    /// polls with records still pending the backlog is abandoned (the
    /// consumer is already discarding it).
    pub fn close(mut self) -> Result<()> {
        // Dropping the sender disconnects the channel once drained.
        self.sender.take();

        let mut grace = self.options.close_grace_polls;
        loop {
            let pending = self.pending();
            if pending == 0 {
                break;
            }
            if self.cancel.is_cancelled() {
                if grace == 0 {
                    warn!(
                        writer = %self.name,
                        pending,
                        "closing with records still pending after cancellation"
                    );
                    break;
                }
                grace -= 1;
            }
            debug!(writer = %self.name, pending, "waiting for writer to drain");
            std::thread::sleep(self.options.close_poll_interval);
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(Error::WriterClosed(self.name.clone()));
            }
        }
        if self.fatal.load(Ordering::Acquire) {
            return Err(Error::WriterFatal(self.name.clone()));
        }
        info!(writer = %self.name, "writer closed");
        Ok(())
    }
}

impl<T> Drop for BufferedWriter<T> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Consumer<T> {
    name: String,
    target: WriterTarget,
    header: Option<String>,
    serializer: Serializer<T>,
    max_records_per_file: Option<usize>,
    pending: Arc<AtomicUsize>,
    fatal: Arc<AtomicBool>,
    cancel: CancellationToken,
    current: Option<BufWriter<File>>,
    records_in_file: usize,
    file_seq: u64,
}

impl<T> Consumer<T> {
    fn run(mut self, receiver: Receiver<T>) {
        // recv drains buffered records, then errors once all senders drop.
        while let Ok(record) = receiver.recv() {
            if self.fatal.load(Ordering::Acquire) {
                // Failed earlier: discard so shutdown can drain the queue.
                self.pending.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            if let Err(reason) = self.persist(&record) {
                error!(
                    writer = %self.name,
                    %reason,
                    "unrecoverable write failure, cancelling the run"
                );
                self.fatal.store(true, Ordering::Release);
                self.cancel.cancel();
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(mut file) = self.current.take() {
            if let Err(e) = file.flush() {
                error!(writer = %self.name, error = %e, "flush on close failed");
                self.fatal.store(true, Ordering::Release);
                self.cancel.cancel();
            }
        }
    }

    fn persist(&mut self, record: &T) -> std::result::Result<(), String> {
        let line = (self.serializer)(record)?;
        self.ensure_file().map_err(|e| e.to_string())?;
        let file = self
            .current
            .as_mut()
            .ok_or_else(|| "no open output file".to_string())?;
        file.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
        file.write_all(b"\n").map_err(|e| e.to_string())?;
        self.records_in_file += 1;

        if let (WriterTarget::Rotating { .. }, Some(max)) =
            (&self.target, self.max_records_per_file)
        {
            if self.records_in_file >= max {
                if let Some(mut done) = self.current.take() {
                    done.flush().map_err(|e| e.to_string())?;
                }
                self.records_in_file = 0;
            }
        }
        Ok(())
    }

    fn ensure_file(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        match &self.target {
            WriterTarget::Stable(path) => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                // Header only when starting the file fresh.
                let fresh = file.metadata()?.len() == 0;
                let mut writer = BufWriter::new(file);
                if fresh {
                    self.write_header(&mut writer)?;
                }
                debug!(writer = %self.name, path = %path.display(), "opened output file");
                self.current = Some(writer);
            }
            WriterTarget::Rotating {
                dir,
                prefix,
                extension,
            } => {
                let stamp = Utc::now().format("%Y%m%dT%H%M%S");
                let path = dir.join(format!(
                    "{prefix}-{stamp}-{:04}.{extension}",
                    self.file_seq
                ));
                self.file_seq += 1;
                let mut writer = BufWriter::new(File::create(&path)?);
                self.write_header(&mut writer)?;
                debug!(writer = %self.name, path = %path.display(), "opened output file");
                self.current = Some(writer);
            }
        }
        Ok(())
    }

    fn write_header(&self, writer: &mut BufWriter<File>) -> Result<()> {
        if let Some(header) = &self.header {
            writer.write_all(header.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_options(max: Option<usize>) -> WriterOptions {
        WriterOptions {
            max_records_per_file: max,
            close_poll_interval: Duration::from_millis(5),
            close_grace_polls: 3,
        }
    }

    fn string_writer(
        name: &str,
        target: WriterTarget,
        header: Option<&str>,
        options: WriterOptions,
        cancel: CancellationToken,
    ) -> BufferedWriter<String> {
        BufferedWriter::new(
            name,
            target,
            header.map(str::to_string),
            Box::new(|s: &String| Ok(s.clone())),
            options,
            cancel,
        )
        .unwrap()
    }

    fn sorted_files(dir: &TempDir) -> Vec<PathBuf> {
        let mut files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_all_records_persisted_on_close() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.tsv");
        let writer = string_writer(
            "test",
            WriterTarget::Stable(path.clone()),
            None,
            fast_options(None),
            CancellationToken::new(),
        );

        for i in 0..100 {
            writer.enqueue(format!("record-{i}")).unwrap();
        }
        writer.close().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 100);
        assert!(contents.ends_with("record-99\n"));
    }

    #[test]
    fn test_rotation_splits_records_across_files() {
        let tmp = TempDir::new().unwrap();
        let writer = string_writer(
            "test",
            WriterTarget::Rotating {
                dir: tmp.path().to_path_buf(),
                prefix: "graph".to_string(),
                extension: "tsv".to_string(),
            },
            None,
            fast_options(Some(2)),
            CancellationToken::new(),
        );

        for i in 0..5 {
            writer.enqueue(format!("r{i}")).unwrap();
        }
        writer.close().unwrap();

        let files = sorted_files(&tmp);
        assert_eq!(files.len(), 3);
        let counts: Vec<usize> = files
            .iter()
            .map(|p| fs::read_to_string(p).unwrap().lines().count())
            .collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_header_written_to_every_rotated_file() {
        let tmp = TempDir::new().unwrap();
        let writer = string_writer(
            "test",
            WriterTarget::Rotating {
                dir: tmp.path().to_path_buf(),
                prefix: "stats".to_string(),
                extension: "tsv".to_string(),
            },
            Some("a\tb"),
            fast_options(Some(1)),
            CancellationToken::new(),
        );

        writer.enqueue("1\t2".to_string()).unwrap();
        writer.enqueue("3\t4".to_string()).unwrap();
        writer.close().unwrap();

        for path in sorted_files(&tmp) {
            let contents = fs::read_to_string(&path).unwrap();
            assert!(contents.starts_with("a\tb\n"), "{contents}");
        }
    }

    #[test]
    fn test_stable_target_appends_without_duplicate_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.tsv");

        for round in 0..2 {
            let writer = string_writer(
                "test",
                WriterTarget::Stable(path.clone()),
                Some("h"),
                fast_options(None),
                CancellationToken::new(),
            );
            writer.enqueue(format!("round-{round}")).unwrap();
            writer.close().unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "h\nround-0\nround-1\n");
    }

    #[test]
    fn test_serialization_failure_cancels_the_run() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let writer: BufferedWriter<String> = BufferedWriter::new(
            "test",
            WriterTarget::Stable(tmp.path().join("out.tsv")),
            None,
            Box::new(|_: &String| Err("cannot encode".to_string())),
            fast_options(None),
            cancel.clone(),
        )
        .unwrap();

        writer.enqueue("x".to_string()).unwrap();

        // The consumer trips the shared token.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !cancel.is_cancelled() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(cancel.is_cancelled());
        assert!(matches!(
            writer.close().unwrap_err(),
            Error::WriterFatal(_)
        ));
    }

    #[test]
    fn test_can_close_reflects_backlog() {
        let tmp = TempDir::new().unwrap();
        let writer = string_writer(
            "test",
            WriterTarget::Stable(tmp.path().join("out.tsv")),
            None,
            fast_options(None),
            CancellationToken::new(),
        );

        for i in 0..50 {
            writer.enqueue(format!("{i}")).unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !writer.can_close() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(writer.can_close());
        writer.close().unwrap();
    }
}

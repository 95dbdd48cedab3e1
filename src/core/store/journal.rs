//! Append-only journal backing [`MemoryStore`](super::MemoryStore).
//!
//! Layout:
//! - a 32 byte file header (`KRJOURN\0`, version, reserved)
//! - records of `id: u64 | len: u32 | crc32: u32 | payload`
//!
//! Appends go through a single writer task that batches whatever is queued,
//! writes it with one `write_all` and fsyncs according to [`JournalConfig`].
//! Every append waits for its batch to hit the file before returning, so a
//! committed transaction is never reported before its record is written.
//!
//! A torn record at the tail (partial header or payload) is treated as never
//! written and cut off on open. A checksum mismatch is corruption.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crc32fast::Hasher as Crc32Hasher;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

const HEADER_MAGIC: &[u8; 8] = b"KRJOURN\0";
const HEADER_VERSION: u32 = 1;
const HEADER_LEN: u64 = 32;
const RECORD_HEADER_LEN: usize = 8 + 4 + 4;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal writer stopped")]
    WriterStopped,

    #[error("journal write failed: {0}")]
    WriteFailed(String),

    #[error("invalid journal config: {0}")]
    InvalidConfig(String),

    #[error("journal corruption: {0}")]
    Corruption(String),
}

/// Flush policy for the journal writer.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Call fsync every N records. If `None`, do not fsync based on record count.
    pub fsync_every_n: Option<usize>,
    /// Call fsync if at least this duration has elapsed since the last fsync.
    pub fsync_interval: Option<Duration>,
    /// Capacity of the writer channel. Appends wait when it is full.
    pub channel_capacity: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            fsync_every_n: Some(64),
            fsync_interval: None,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub id: u64,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct Journal {
    sender: mpsc::Sender<JournalMessage>,
    next_id: AtomicU64,
    append_count: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

type Ack = oneshot::Sender<Result<(), JournalError>>;

#[derive(Debug)]
struct WriteRequest {
    header: [u8; RECORD_HEADER_LEN],
    payload: Bytes,
    ack: Ack,
}

#[derive(Debug)]
enum JournalMessage {
    Record(WriteRequest),
    Flush(Ack),
}

struct JournalWriter {
    file: File,
    unflushed_records: usize,
    last_fsync: Instant,
    config: JournalConfig,
    receiver: mpsc::Receiver<JournalMessage>,
    append_count: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl Journal {
    /// Open or create a journal at `path` and start its writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open<P: AsRef<Path>>(path: P, config: JournalConfig) -> Result<Self, JournalError> {
        if config.channel_capacity == 0 {
            return Err(JournalError::InvalidConfig(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }

        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path_ref)
            .await?;

        let len = file.metadata().await?.len();
        if len == 0 {
            write_header(&mut file).await?;
        } else if len < HEADER_LEN {
            return Err(JournalError::Corruption(
                "file too small to contain header".to_string(),
            ));
        } else {
            validate_header(&mut file).await?;
        }

        let (records, end_offset) = scan_records(&mut file).await?;
        let next_id = records.last().map(|r| r.id.wrapping_add(1)).unwrap_or(1);

        let file_len = file.metadata().await?.len();
        if file_len > end_offset {
            debug!(
                target: "keyrouter::journal",
                path = %path_ref.display(),
                dropped = file_len - end_offset,
                "cutting torn tail"
            );
            file.set_len(end_offset).await?;
        }
        file.seek(std::io::SeekFrom::Start(end_offset)).await?;

        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let append_count = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));

        let writer = JournalWriter {
            file,
            unflushed_records: 0,
            last_fsync: Instant::now(),
            config,
            receiver,
            append_count: Arc::clone(&append_count),
            bytes_written: Arc::clone(&bytes_written),
        };

        tokio::spawn(async move {
            if let Err(err) = writer.run().await {
                error!(target: "keyrouter::journal", "journal writer stopped with error: {err}");
            }
        });

        Ok(Self {
            sender,
            next_id: AtomicU64::new(next_id),
            append_count,
            bytes_written,
        })
    }

    /// Read every intact record of the journal at `path`.
    ///
    /// A missing file yields no records.
    pub async fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<JournalRecord>, JournalError> {
        let mut file = match File::open(path.as_ref()).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        if len < HEADER_LEN {
            return Err(JournalError::Corruption(
                "file too small to contain header".to_string(),
            ));
        }
        validate_header(&mut file).await?;
        let (records, _) = scan_records(&mut file).await?;
        Ok(records)
    }

    /// Replace the journal at `path` with exactly `payloads`.
    ///
    /// The new log is written next to the old one and renamed over it, so a
    /// crash mid-rewrite leaves the previous journal intact. Must not be
    /// called while a [`Journal`] is open on the same path.
    pub async fn rewrite<P: AsRef<Path>>(path: P, payloads: &[Bytes]) -> Result<(), JournalError> {
        let path_ref = path.as_ref();
        let tmp = path_ref.with_extension("compact");

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .await?;
        write_header(&mut file).await?;

        let mut buffer = Vec::new();
        for (idx, payload) in payloads.iter().enumerate() {
            let header = encode_record_header(idx as u64 + 1, payload)?;
            buffer.extend_from_slice(&header);
            buffer.extend_from_slice(payload);
        }
        file.write_all(&buffer).await?;
        file.flush().await?;
        file.sync_data().await?;
        drop(file);

        fs::rename(&tmp, path_ref).await?;
        Ok(())
    }

    /// Append a record, returning its logical id once it has been written.
    #[tracing::instrument(skip(self, payload), fields(len = payload.len()))]
    pub async fn append(&self, payload: Bytes) -> Result<u64, JournalError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let header = encode_record_header(id, &payload)?;
        let (ack, done) = oneshot::channel();

        self.sender
            .send(JournalMessage::Record(WriteRequest {
                header,
                payload,
                ack,
            }))
            .await
            .map_err(|_| JournalError::WriterStopped)?;

        done.await.map_err(|_| JournalError::WriterStopped)??;
        Ok(id)
    }

    /// Force a flush of buffered data and an fsync, regardless of configuration.
    pub async fn flush(&self) -> Result<(), JournalError> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(JournalMessage::Flush(sender))
            .await
            .map_err(|_| JournalError::WriterStopped)?;
        receiver.await.map_err(|_| JournalError::WriterStopped)?
    }

    /// Number of appends and total bytes written since this journal was opened.
    pub fn metrics(&self) -> (u64, u64) {
        (
            self.append_count.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }
}

impl JournalWriter {
    async fn run(mut self) -> Result<(), JournalError> {
        while let Some(message) = self.receiver.recv().await {
            match message {
                JournalMessage::Record(record) => {
                    let (records, pending_flush) = self.collect_batch(record);
                    self.write_batch(records).await?;
                    if let Some(flush_sender) = pending_flush {
                        let result = self.flush_file().await;
                        let _ = flush_sender.send(result);
                    }
                }
                JournalMessage::Flush(sender) => {
                    let result = self.flush_file().await;
                    let _ = sender.send(result);
                }
            }
        }

        Ok(())
    }

    fn collect_batch(&mut self, first: WriteRequest) -> (Vec<WriteRequest>, Option<Ack>) {
        let mut records = vec![first];
        let mut pending_flush = None;

        loop {
            match self.receiver.try_recv() {
                Ok(JournalMessage::Record(record)) => records.push(record),
                Ok(JournalMessage::Flush(sender)) => {
                    pending_flush = Some(sender);
                    break;
                }
                Err(_) => break,
            }
        }

        (records, pending_flush)
    }

    async fn write_batch(&mut self, records: Vec<WriteRequest>) -> Result<(), JournalError> {
        let buffer_len = records
            .iter()
            .map(|r| RECORD_HEADER_LEN + r.payload.len())
            .sum();
        let mut buffer = Vec::with_capacity(buffer_len);
        for record in &records {
            buffer.extend_from_slice(&record.header);
            buffer.extend_from_slice(&record.payload);
        }

        let written = match self.write_and_sync(&buffer, records.len()).await {
            Ok(()) => Ok(()),
            Err(err) => Err(err.to_string()),
        };

        for record in records {
            let reply = written.clone().map_err(JournalError::WriteFailed);
            let _ = record.ack.send(reply);
        }

        // A failed write leaves the file in an unknown state; stop accepting.
        written.map_err(JournalError::WriteFailed)
    }

    async fn write_and_sync(&mut self, buffer: &[u8], records: usize) -> Result<(), JournalError> {
        self.file.write_all(buffer).await?;

        self.append_count.fetch_add(records as u64, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);

        self.unflushed_records = self.unflushed_records.saturating_add(records);
        self.maybe_sync().await
    }

    async fn flush_file(&mut self) -> Result<(), JournalError> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.unflushed_records = 0;
        self.last_fsync = Instant::now();
        Ok(())
    }

    async fn maybe_sync(&mut self) -> Result<(), JournalError> {
        let by_count = self
            .config
            .fsync_every_n
            .is_some_and(|every_n| self.unflushed_records >= every_n);
        let by_time = self
            .config
            .fsync_interval
            .is_some_and(|interval| self.last_fsync.elapsed() >= interval);

        if by_count || by_time {
            let span = tracing::trace_span!("journal_fsync");
            let _guard = span.enter();
            self.flush_file().await?;
        } else {
            self.file.flush().await?;
        }

        Ok(())
    }
}

fn encode_record_header(id: u64, payload: &[u8]) -> Result<[u8; RECORD_HEADER_LEN], JournalError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    header[..8].copy_from_slice(&id.to_le_bytes());
    let len = u32::try_from(payload.len())
        .map_err(|_| JournalError::Corruption("record too large".to_string()))?;
    header[8..12].copy_from_slice(&len.to_le_bytes());

    let mut hasher = Crc32Hasher::new();
    hasher.update(payload);
    header[12..16].copy_from_slice(&hasher.finalize().to_le_bytes());
    Ok(header)
}

async fn write_header(file: &mut File) -> Result<(), JournalError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..8].copy_from_slice(HEADER_MAGIC);
    buf[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    // Remaining bytes are reserved / zero.
    file.write_all(&buf).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

async fn validate_header(file: &mut File) -> Result<(), JournalError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    file.seek(std::io::SeekFrom::Start(0)).await?;
    if !read_full(file, &mut buf).await? {
        return Err(JournalError::Corruption(
            "unexpected EOF while reading journal header".to_string(),
        ));
    }

    if &buf[..8] != HEADER_MAGIC {
        return Err(JournalError::Corruption("invalid journal magic".to_string()));
    }

    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&buf[8..12]);
    let version = u32::from_le_bytes(version_bytes);
    if version != HEADER_VERSION {
        return Err(JournalError::Corruption(format!(
            "unsupported journal version: {version}"
        )));
    }

    Ok(())
}

/// Read records from just past the header until EOF or a torn tail.
///
/// Returns the records and the offset right after the last intact one.
async fn scan_records(file: &mut File) -> Result<(Vec<JournalRecord>, u64), JournalError> {
    file.seek(std::io::SeekFrom::Start(HEADER_LEN)).await?;
    let mut offset = HEADER_LEN;
    let mut records = Vec::new();

    while let Some((record, total_len)) = read_next_record(file, offset).await? {
        records.push(record);
        offset = offset
            .checked_add(total_len)
            .ok_or_else(|| JournalError::Corruption("log offset overflow".to_string()))?;
    }

    Ok((records, offset))
}

async fn read_next_record(
    file: &mut File,
    current_offset: u64,
) -> Result<Option<(JournalRecord, u64)>, JournalError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    if !read_full(file, &mut header).await? {
        // Clean EOF or partial header: no further records.
        return Ok(None);
    }

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&header[..8]);
    let id = u64::from_le_bytes(id_bytes);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[8..12]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&header[12..16]);
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let mut payload = vec![0u8; len];
    if !read_full(file, &mut payload).await? {
        // Partial payload at end of file: treat tail as not present.
        return Ok(None);
    }

    let mut hasher = Crc32Hasher::new();
    hasher.update(&payload);
    let actual_crc = hasher.finalize();

    if actual_crc != expected_crc {
        return Err(JournalError::Corruption(format!(
            "CRC mismatch at offset {current_offset}: expected {expected_crc:08x}, got {actual_crc:08x}"
        )));
    }

    let total_len = RECORD_HEADER_LEN as u64 + len as u64;
    Ok(Some((
        JournalRecord {
            id,
            payload: Bytes::from(payload),
        },
        total_len,
    )))
}

/// Fill `buf` completely. Returns `false` if EOF came first.
async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<bool, JournalError> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = file.read(&mut buf[read..]).await?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn journal_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("router.journal")
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);

        let journal = Journal::open(&path, JournalConfig::default()).await.unwrap();
        let id1 = journal.append(Bytes::from_static(b"first")).await.unwrap();
        let id2 = journal.append(Bytes::from_static(b"second")).await.unwrap();
        journal.flush().await.unwrap();

        let records = Journal::read_records(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, id1);
        assert_eq!(records[0].payload, Bytes::from_static(b"first"));
        assert_eq!(records[1].id, id2);
        assert_eq!(records[1].payload, Bytes::from_static(b"second"));
        assert_eq!(journal.metrics().0, 2);
    }

    #[tokio::test]
    async fn ids_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        {
            let journal = Journal::open(&path, JournalConfig::default()).await.unwrap();
            journal.append(Bytes::from_static(b"a")).await.unwrap();
            journal.append(Bytes::from_static(b"b")).await.unwrap();
            journal.flush().await.unwrap();
        }

        let journal = Journal::open(&path, JournalConfig::default()).await.unwrap();
        let id = journal.append(Bytes::from_static(b"c")).await.unwrap();
        assert_eq!(id, 3);
    }

    #[tokio::test]
    async fn torn_tail_is_ignored_and_cut() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        {
            let journal = Journal::open(&path, JournalConfig::default()).await.unwrap();
            journal.append(Bytes::from_static(b"intact")).await.unwrap();
            journal.flush().await.unwrap();
        }

        // Half a record header.
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[7u8; 6]).unwrap();
        }

        let records = Journal::read_records(&path).await.unwrap();
        assert_eq!(records.len(), 1);

        let journal = Journal::open(&path, JournalConfig::default()).await.unwrap();
        journal.append(Bytes::from_static(b"after")).await.unwrap();
        journal.flush().await.unwrap();

        let records = Journal::read_records(&path).await.unwrap();
        let payloads: Vec<_> = records.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![Bytes::from_static(b"intact"), Bytes::from_static(b"after")]
        );
    }

    #[tokio::test]
    async fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        {
            let journal = Journal::open(&path, JournalConfig::default()).await.unwrap();
            journal.append(Bytes::from_static(b"good")).await.unwrap();
            journal.append(Bytes::from_static(b"also good")).await.unwrap();
            journal.flush().await.unwrap();
        }

        use std::io::{Read, Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::End(-1)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.seek(SeekFrom::End(-1)).unwrap();
        file.write_all(&byte).unwrap();
        file.flush().unwrap();

        match Journal::open(&path, JournalConfig::default()).await {
            Err(JournalError::Corruption(_)) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        {
            let journal = Journal::open(&path, JournalConfig::default()).await.unwrap();
            for _ in 0..5 {
                journal.append(Bytes::from_static(b"old")).await.unwrap();
            }
            journal.flush().await.unwrap();
        }

        Journal::rewrite(&path, &[Bytes::from_static(b"snapshot")])
            .await
            .unwrap();

        let records = Journal::read_records(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].payload, Bytes::from_static(b"snapshot"));
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalConfig {
            channel_capacity: 0,
            ..JournalConfig::default()
        };
        let err = Journal::open(journal_path(&dir), config).await.unwrap_err();
        assert!(matches!(err, JournalError::InvalidConfig(_)));
    }
}

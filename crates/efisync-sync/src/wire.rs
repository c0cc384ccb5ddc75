//! Producer/consumer wire protocol
//!
//! Length-prefixed frames over TCP:
//!
//! ```text
//! +---------+-------------------+-----------------+
//! | type u8 | payload len u32BE | payload         |
//! +---------+-------------------+-----------------+
//! ```
//!
//! A connection carries one request.
//!
//! ```text
//! push:      HEADER ─→              ←─ STATUS (skipped | proceed)
//!            DATA* END ─→           ←─ PROGRESS* STATUS (committed | error)
//! pull:      HEADER ─→              ←─ STATUS (record) DATA* END
//! manifest:  HEADER ─→              ←─ STATUS (records)
//! ```
//!
//! Data frames are either raw (`DATA`) or one zlib stream per chunk
//! (`DATA_Z`). The receiving side writes through [`LocalSink`], so remote
//! files get the same temp, verify, rename treatment as local ones.
//!
//! The I/O timeout bounds each frame read and write, never a whole file.
//! During a push the receiver answers every data frame with a `PROGRESS`
//! frame carrying the bytes written so far, so a slow but live consumer
//! keeps the producer's reads inside the timeout.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use efisync_core::{
    config::{EndpointConfig, TransferConfig},
    domain::{ErrorKind, FileRecord, Fingerprint, RecordPath, TransferError},
    ports::{IRemoteCatalog, TransferOutcome},
};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::detector::{to_utc, ChangeDetector};
use crate::fingerprint::{hash_file, StreamingFingerprint};
use crate::memory::MemoryRecordStore;
use crate::transfer::{already_present, LocalSink};
use crate::SyncError;

pub const FRAME_HEADER: u8 = 1;
pub const FRAME_DATA: u8 = 2;
pub const FRAME_DATA_Z: u8 = 3;
pub const FRAME_END: u8 = 4;
pub const FRAME_STATUS: u8 = 5;
pub const FRAME_PROGRESS: u8 = 6;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Unexpected frame type {0}")]
    UnexpectedFrame(u8),

    #[error("Connection closed mid-exchange")]
    UnexpectedEof,

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The peer answered with a classified failure
    #[error("Remote error: {0}")]
    Remote(TransferError),
}

impl From<WireError> for TransferError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => TransferError::io("wire", &e),
            WireError::Timeout(_) => TransferError::new(ErrorKind::NetworkTimeout, err.to_string()),
            WireError::UnexpectedEof => {
                TransferError::new(ErrorKind::ConnectionLost, err.to_string())
            }
            WireError::FrameTooLarge(_)
            | WireError::UnexpectedFrame(_)
            | WireError::Malformed(_) => TransferError::new(ErrorKind::Protocol, err.to_string()),
            WireError::Remote(e) => e,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Header frame payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Push {
        path: RecordPath,
        size: u64,
        fingerprint: Fingerprint,
        modified: DateTime<Utc>,
        compressed: bool,
    },
    Pull {
        path: RecordPath,
        compress: bool,
    },
    Manifest {
        prefix: String,
    },
}

/// Status frame payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub ok: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransferError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<FileRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<FileRecord>,
}

impl Status {
    fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    fn failed(error: TransferError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    fn into_result(self) -> Result<Self, WireError> {
        match self.error {
            Some(e) => Err(WireError::Remote(e)),
            None if !self.ok => Err(WireError::Remote(TransferError::new(
                ErrorKind::Protocol,
                "peer refused without an error",
            ))),
            None => Ok(self),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

pub async fn write_frame<W>(writer: &mut W, kind: u8, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let mut header = [0u8; 5];
    header[0] = kind;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one frame; `None` on a clean close before the first byte
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    read_exact_or_eof(reader, &mut header[1..]).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    read_exact_or_eof(reader, &mut payload).await?;
    Ok(Some((header[0], payload)))
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}

async fn expect_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>), WireError>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader).await?.ok_or(WireError::UnexpectedEof)
}

/// Run one frame exchange under `limit`; `None` waits forever
async fn within<T, F>(limit: Option<Duration>, fut: F) -> Result<T, WireError>
where
    F: std::future::Future<Output = Result<T, WireError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| WireError::Timeout(limit))?,
        None => fut.await,
    }
}

async fn write_json<W, T>(writer: &mut W, kind: u8, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_frame(writer, kind, &serde_json::to_vec(value)?).await
}

async fn read_status<R>(reader: &mut R) -> Result<Status, WireError>
where
    R: AsyncRead + Unpin,
{
    match expect_frame(reader).await? {
        (FRAME_STATUS, payload) => Ok(serde_json::from_slice(&payload)?),
        (other, _) => Err(WireError::UnexpectedFrame(other)),
    }
}

fn compress_chunk(chunk: &[u8], level: u32) -> Result<Vec<u8>, WireError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(chunk.len() / 2), Compression::new(level));
    encoder.write_all(chunk)?;
    Ok(encoder.finish()?)
}

fn decompress_chunk(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    ZlibDecoder::new(payload)
        .take(MAX_FRAME_LEN as u64)
        .read_to_end(&mut out)?;
    Ok(out)
}

/// Stream a file as data frames followed by END
async fn send_file<W>(
    writer: &mut W,
    path: &Path,
    chunk_size: usize,
    compression: Option<u32>,
    io_timeout: Option<Duration>,
) -> Result<(Fingerprint, u64), WireError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; chunk_size.clamp(1, MAX_FRAME_LEN)];
    let mut hasher = StreamingFingerprint::new();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        let frame = match compression {
            Some(level) => (FRAME_DATA_Z, compress_chunk(&buf[..n], level)?),
            None => (FRAME_DATA, buf[..n].to_vec()),
        };
        within(io_timeout, write_frame(writer, frame.0, &frame.1)).await?;
    }
    within(io_timeout, async {
        write_frame(writer, FRAME_END, &[]).await?;
        writer.flush().await?;
        Ok(())
    })
    .await?;
    Ok(hasher.finish())
}

/// Wait for the final status of a push, skipping progress frames
async fn await_commit<R>(reader: &mut R, io_timeout: Duration) -> Result<Status, WireError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match within(Some(io_timeout), expect_frame(reader)).await? {
            (FRAME_PROGRESS, _) => {}
            (FRAME_STATUS, payload) => return Ok(serde_json::from_slice(&payload)?),
            (other, _) => return Err(WireError::UnexpectedFrame(other)),
        }
    }
}

/// Feed data frames into `sink` until END
///
/// A sink failure is remembered and the rest of the stream is drained so the
/// peer still receives a status. With `acknowledge` set every data frame is
/// answered with a progress frame.
async fn receive_into<S>(
    stream: &mut S,
    sink: &mut LocalSink,
    io_timeout: Option<Duration>,
    acknowledge: bool,
) -> Result<Option<TransferError>, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut failure = None;
    let mut received: u64 = 0;
    loop {
        let (kind, payload) = within(io_timeout, expect_frame(stream)).await?;
        let chunk = match kind {
            FRAME_DATA => payload,
            FRAME_DATA_Z => decompress_chunk(&payload)?,
            FRAME_END => return Ok(failure),
            FRAME_STATUS => {
                let status: Status = serde_json::from_slice(&payload)?;
                status.into_result()?;
                return Err(WireError::UnexpectedFrame(FRAME_STATUS));
            }
            other => return Err(WireError::UnexpectedFrame(other)),
        };
        received += chunk.len() as u64;
        if failure.is_none() {
            if let Err(e) = sink.write(&chunk).await {
                failure = Some(e);
            }
        }
        if acknowledge {
            within(
                io_timeout,
                write_frame(stream, FRAME_PROGRESS, &received.to_be_bytes()),
            )
            .await?;
        }
    }
}

// ============================================================================
// WireClient
// ============================================================================

/// Producer side of the protocol
pub struct WireClient {
    address: String,
    io_timeout: Duration,
    chunk_size: usize,
    compression: Option<u32>,
}

impl WireClient {
    #[must_use]
    pub fn new(endpoint: &EndpointConfig, transfer: &TransferConfig) -> Self {
        Self {
            address: endpoint.address(),
            io_timeout: endpoint.io_timeout(),
            chunk_size: transfer.chunk_size(),
            compression: transfer.compression(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, WireError>
    where
        F: std::future::Future<Output = Result<T, WireError>>,
    {
        within(Some(self.io_timeout), fut).await
    }

    async fn connect(&self) -> Result<TcpStream, WireError> {
        self.timed(async { Ok(TcpStream::connect(&self.address).await?) })
            .await
    }

    /// Send `local` to `remote`, verified against `record`
    #[instrument(skip(self, record), fields(local = %local.display(), remote = %remote))]
    pub async fn push(
        &self,
        local: &Path,
        record: &FileRecord,
        remote: &RecordPath,
    ) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        if tokio::fs::metadata(local).await.is_err() {
            return Err(TransferError::new(
                ErrorKind::SourceMissing,
                format!("{} not found", local.display()),
            ));
        }

        let mut stream = self.connect().await?;
        let request = Request::Push {
            path: remote.clone(),
            size: record.size,
            fingerprint: record.fingerprint.clone(),
            modified: record.modified,
            compressed: self.compression.is_some(),
        };
        self.timed(write_json(&mut stream, FRAME_HEADER, &request))
            .await?;
        let answer = self.timed(read_status(&mut stream)).await?.into_result()?;
        if answer.skipped {
            debug!("Remote already holds identical content");
            return Ok(TransferOutcome {
                bytes: 0,
                fingerprint: record.fingerprint.clone(),
                skipped: true,
                duration: started.elapsed(),
            });
        }

        let (mut reader, mut writer) = stream.split();
        let ((sent, bytes), final_status) = tokio::try_join!(
            send_file(
                &mut writer,
                local,
                self.chunk_size,
                self.compression,
                Some(self.io_timeout),
            ),
            await_commit(&mut reader, self.io_timeout),
        )?;
        if sent != record.fingerprint {
            return Err(TransferError::new(
                ErrorKind::SourceChanged,
                format!("{} changed since it was scanned", local.display()),
            ));
        }
        final_status.into_result()?;

        Ok(TransferOutcome {
            bytes,
            fingerprint: sent,
            skipped: false,
            duration: started.elapsed(),
        })
    }

    /// Fetch `remote` into `local`
    ///
    /// The write is verified against the fingerprint the consumer reports at
    /// request time, which may be newer than `record`.
    #[instrument(skip(self, record), fields(remote = %remote, local = %local.display()))]
    pub async fn pull(
        &self,
        remote: &RecordPath,
        local: &Path,
        record: &FileRecord,
    ) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        if already_present(local, record.size, &record.fingerprint).await {
            return Ok(TransferOutcome {
                bytes: 0,
                fingerprint: record.fingerprint.clone(),
                skipped: true,
                duration: started.elapsed(),
            });
        }

        let mut stream = self.connect().await?;
        let request = Request::Pull {
            path: remote.clone(),
            compress: self.compression.is_some(),
        };
        self.timed(write_json(&mut stream, FRAME_HEADER, &request))
            .await?;
        let answer = self.timed(read_status(&mut stream)).await?.into_result()?;
        let current = answer.record.ok_or_else(|| {
            TransferError::new(ErrorKind::Protocol, "pull answer without a record")
        })?;

        let mut sink = LocalSink::create(local).await?;
        if let Some(failure) =
            receive_into(&mut stream, &mut sink, Some(self.io_timeout), false).await?
        {
            return Err(failure);
        }
        let (fingerprint, bytes) = sink.commit(&current.fingerprint).await?;
        Ok(TransferOutcome {
            bytes,
            fingerprint,
            skipped: false,
            duration: started.elapsed(),
        })
    }
}

#[async_trait::async_trait]
impl IRemoteCatalog for WireClient {
    async fn manifest(&self, prefix: &str) -> Result<Vec<FileRecord>, TransferError> {
        let mut stream = self.connect().await?;
        let request = Request::Manifest {
            prefix: prefix.to_string(),
        };
        self.timed(write_json(&mut stream, FRAME_HEADER, &request))
            .await?;
        let status = self.timed(read_status(&mut stream)).await?.into_result()?;
        Ok(status.records)
    }
}

// ============================================================================
// TransferReceiver
// ============================================================================

/// Consumer side of the protocol, serving one directory tree
pub struct TransferReceiver {
    root: PathBuf,
    chunk_size: usize,
    catalog: Mutex<ChangeDetector>,
}

impl TransferReceiver {
    /// Serve `root`; manifests skip files matching `exclude`
    pub fn new(
        root: PathBuf,
        transfer: &TransferConfig,
        exclude: &[String],
    ) -> Result<Self, SyncError> {
        let detector = ChangeDetector::new(
            Arc::new(MemoryRecordStore::new()),
            exclude,
            Duration::ZERO,
        )?;
        Ok(Self {
            root,
            chunk_size: transfer.chunk_size(),
            catalog: Mutex::new(detector),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Accept connections until `cancel` fires
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        info!(
            listen = %listener.local_addr()?,
            root = %self.root.display(),
            "Receiver listening"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.handle(stream).await {
                                warn!(peer = %peer, error = %e, "Receiver connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
        info!("Receiver stopped");
        Ok(())
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<(), WireError> {
        let Some((kind, payload)) = read_frame(&mut stream).await? else {
            debug!("Connection closed without a request");
            return Ok(());
        };
        if kind != FRAME_HEADER {
            return Err(WireError::UnexpectedFrame(kind));
        }
        match serde_json::from_slice::<Request>(&payload)? {
            Request::Push {
                path,
                size,
                fingerprint,
                modified,
                compressed: _,
            } => {
                let record = FileRecord::new(path, size, fingerprint, modified);
                self.receive(&mut stream, record).await
            }
            Request::Pull { path, compress } => self.send(&mut stream, &path, compress).await,
            Request::Manifest { prefix } => {
                let status = match self.manifest(&prefix).await {
                    Ok(records) => Status {
                        records,
                        ..Status::ok()
                    },
                    Err(e) => Status::failed(e),
                };
                write_json(&mut stream, FRAME_STATUS, &status).await
            }
        }
    }

    async fn receive(&self, stream: &mut TcpStream, record: FileRecord) -> Result<(), WireError> {
        let destination = record.path.to_path(&self.root);
        if already_present(&destination, record.size, &record.fingerprint).await {
            let status = Status {
                skipped: true,
                ..Status::ok()
            };
            return write_json(stream, FRAME_STATUS, &status).await;
        }

        let mut sink = match LocalSink::create(&destination).await {
            Ok(sink) => sink,
            Err(e) => return write_json(stream, FRAME_STATUS, &Status::failed(e)).await,
        };
        write_json(stream, FRAME_STATUS, &Status::ok()).await?;

        let status = match receive_into(stream, &mut sink, None, true).await? {
            Some(failure) => Status::failed(failure),
            None => match sink.commit(&record.fingerprint).await {
                Ok((_, bytes)) => {
                    debug!(path = %record.path, bytes, "Received file");
                    Status {
                        record: Some(record),
                        ..Status::ok()
                    }
                }
                Err(e) => Status::failed(e),
            },
        };
        write_json(stream, FRAME_STATUS, &status).await
    }

    async fn send(
        &self,
        stream: &mut TcpStream,
        path: &RecordPath,
        compress: bool,
    ) -> Result<(), WireError> {
        let source = path.to_path(&self.root);
        let record = match self.describe(path, &source).await {
            Ok(record) => record,
            Err(e) => return write_json(stream, FRAME_STATUS, &Status::failed(e)).await,
        };
        let status = Status {
            record: Some(record),
            ..Status::ok()
        };
        write_json(stream, FRAME_STATUS, &status).await?;
        let compression = compress.then_some(Compression::default().level());
        send_file(stream, &source, self.chunk_size, compression, None).await?;
        Ok(())
    }

    async fn describe(&self, path: &RecordPath, source: &Path) -> Result<FileRecord, TransferError> {
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| TransferError::io(path, &e))?;
        let modified = meta
            .modified()
            .map(to_utc)
            .unwrap_or_else(|_| Utc::now());
        let (fingerprint, size) = hash_file(source)
            .await
            .map_err(|e| TransferError::io(path, &e))?;
        Ok(FileRecord::new(path.clone(), size, fingerprint, modified))
    }

    async fn manifest(&self, prefix: &str) -> Result<Vec<FileRecord>, TransferError> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            RecordPath::new(prefix)
                .map_err(|e| TransferError::new(ErrorKind::Protocol, e.to_string()))?
                .to_path(&self.root)
        };
        if tokio::fs::metadata(&dir).await.is_err() {
            return Ok(Vec::new());
        }
        let catalog = self.catalog.lock().await;
        let outcome = catalog
            .scan(&dir, None)
            .await
            .map_err(|e| TransferError::new(e.kind(), e.to_string()))?;
        catalog
            .commit(&dir, &outcome)
            .await
            .map_err(|e| TransferError::new(e.kind(), e.to_string()))?;
        let mut records: Vec<FileRecord> = catalog
            .known(&dir)
            .await
            .map_err(|e| TransferError::new(e.kind(), e.to_string()))?
            .into_values()
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }
}

use crate::upload::types::{FileDescriptor, TransferOutcome, UploadCredential};
use async_trait::async_trait;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bytes handed to the transport per read. Progress granularity follows
/// this, bounded further by integer-percent throttling.
const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("storage backend rejected the upload (HTTP {status})")]
    Rejected { status: u16 },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("could not read source file: {0}")]
    Io(#[from] io::Error),
    #[error("upload was cancelled")]
    Cancelled,
    #[error("a transfer is already in flight on this handle")]
    ConcurrentTransfer,
}

impl TransferError {
    /// Cancellation is user intent, not a failure; callers use this to pick
    /// the right message.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, io::Error>> + Send + 'static>>;

/// Raw write to the storage backend. Any 2xx status is success; the
/// response body is not interpreted.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    async fn put(
        &self,
        url: &str,
        content_type: &str,
        content_length: u64,
        body: ByteStream,
    ) -> Result<u16, TransferError>;
}

/// Production transport: one streamed `PUT` against the presigned URL.
#[derive(Clone, Default)]
pub struct HttpStorageTransport {
    client: reqwest::Client,
}

impl HttpStorageTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageTransport for HttpStorageTransport {
    async fn put(
        &self,
        url: &str,
        content_type: &str,
        content_length: u64,
        body: ByteStream,
    ) -> Result<u16, TransferError> {
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Idempotent cancellation token for one transfer attempt. Cancelling after
/// settlement, or repeatedly, is a no-op.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called. Checks the flag around the
    /// notify registration so a cancel racing the await is not missed.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One in-flight transfer attempt.
///
/// Owns the cancellation token and enforces the one-transfer-per-handle
/// contract: a second `transfer` call fails fast instead of queuing. A new
/// attempt always gets a fresh handle (and a fresh credential).
pub struct TransferHandle {
    attempt_id: Uuid,
    cancel: CancelToken,
    started: AtomicBool,
    transport: Arc<dyn StorageTransport>,
}

impl TransferHandle {
    pub fn new(transport: Arc<dyn StorageTransport>) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            cancel: CancelToken::new(),
            started: AtomicBool::new(false),
            transport,
        }
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    /// Clone of this attempt's cancellation token, for callers that need to
    /// cancel after the handle has been moved into the transfer.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stream the file body to the credential's write URL.
    ///
    /// `on_progress` receives `(percent, bytes_sent)` as the transport
    /// consumes chunks, at most once per integer percent. Cancellation
    /// mid-flight aborts the request and rejects with
    /// `TransferError::Cancelled`.
    pub async fn transfer<F>(
        &self,
        file: &FileDescriptor,
        credential: &UploadCredential,
        on_progress: F,
    ) -> Result<TransferOutcome, TransferError>
    where
        F: FnMut(u8, u64) + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(attempt_id = %self.attempt_id, "second transfer call on a live handle");
            return Err(TransferError::ConcurrentTransfer);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let source = tokio::fs::File::open(&file.path).await?;
        let total_bytes = file.size_bytes;

        debug!(
            attempt_id = %self.attempt_id,
            key = %credential.storage_key,
            total_bytes,
            "starting transfer"
        );

        // Small buffer so progress tracks what the transport has actually
        // pulled, not how fast the disk reads.
        let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Vec<u8>, io::Error>>(4);
        tokio::spawn(feed_chunks(source, total_bytes, chunk_tx, on_progress));

        let body: ByteStream = Box::pin(ReceiverStream::new(chunk_rx));
        let put = self
            .transport
            .put(&credential.write_url, &file.content_type, total_bytes, body);
        tokio::pin!(put);

        let status = tokio::select! {
            result = &mut put => result?,
            _ = self.cancel.cancelled() => {
                debug!(attempt_id = %self.attempt_id, "transfer cancelled mid-flight");
                return Err(TransferError::Cancelled);
            }
        };

        if !(200..300).contains(&status) {
            return Err(TransferError::Rejected { status });
        }

        debug!(attempt_id = %self.attempt_id, "transfer complete");
        Ok(TransferOutcome {
            bytes_sent: total_bytes,
            storage_key: credential.storage_key.clone(),
        })
    }
}

/// Read the source file chunk by chunk into the body channel, reporting
/// progress as chunks are accepted. Exits when the transport stops pulling
/// (settled or cancelled request drops the receiver).
async fn feed_chunks<F>(
    mut source: tokio::fs::File,
    total_bytes: u64,
    chunk_tx: mpsc::Sender<Result<Vec<u8>, io::Error>>,
    mut on_progress: F,
) where
    F: FnMut(u8, u64) + Send + 'static,
{
    on_progress(0, 0);

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes_sent: u64 = 0;
    let mut last_percent: u8 = 0;

    loop {
        let read = match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                let _ = chunk_tx.send(Err(e)).await;
                return;
            }
        };

        if chunk_tx.send(Ok(buffer[..read].to_vec())).await.is_err() {
            return;
        }

        bytes_sent += read as u64;
        let percent = percent_of(bytes_sent, total_bytes);
        if percent != last_percent {
            last_percent = percent;
            on_progress(percent, bytes_sent);
        }
    }

    if last_percent != 100 {
        on_progress(100, bytes_sent);
    }
}

fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((sent as f64 / total as f64) * 100.0).min(100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;

    fn write_temp_file(bytes: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; bytes]).unwrap();
        file.flush().unwrap();
        file
    }

    fn descriptor(path: &Path, size: u64) -> FileDescriptor {
        FileDescriptor {
            path: path.to_path_buf(),
            file_name: "feature.mp4".to_string(),
            content_type: "video/mp4".to_string(),
            size_bytes: size,
            duration_seconds: Some(60),
        }
    }

    fn credential() -> UploadCredential {
        UploadCredential {
            write_url: "https://bucket.example/uploads/abc123?sig=x".to_string(),
            storage_key: "uploads/abc123".to_string(),
        }
    }

    /// Drains the body stream and answers with a fixed status.
    struct DrainingTransport {
        status: u16,
        bytes_seen: Arc<Mutex<u64>>,
    }

    #[async_trait]
    impl StorageTransport for DrainingTransport {
        async fn put(
            &self,
            _url: &str,
            _content_type: &str,
            _content_length: u64,
            mut body: ByteStream,
        ) -> Result<u16, TransferError> {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| TransferError::Transport(e.to_string()))?;
                *self.bytes_seen.lock().unwrap() += chunk.len() as u64;
            }
            Ok(self.status)
        }
    }

    /// Never settles; the request only ends through cancellation.
    struct PendingTransport;

    #[async_trait]
    impl StorageTransport for PendingTransport {
        async fn put(
            &self,
            _url: &str,
            _content_type: &str,
            _content_length: u64,
            _body: ByteStream,
        ) -> Result<u16, TransferError> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn successful_transfer_reports_monotonic_progress_ending_at_100() {
        let size = 1024 * 1024;
        let file = write_temp_file(size);
        let bytes_seen = Arc::new(Mutex::new(0));
        let transport = Arc::new(DrainingTransport {
            status: 200,
            bytes_seen: bytes_seen.clone(),
        });

        let progress: Arc<Mutex<Vec<(u8, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let progress_sink = progress.clone();

        let handle = TransferHandle::new(transport);
        let outcome = handle
            .transfer(&descriptor(file.path(), size as u64), &credential(), move |p, b| {
                progress_sink.lock().unwrap().push((p, b));
            })
            .await
            .unwrap();

        assert_eq!(outcome.bytes_sent, size as u64);
        assert_eq!(outcome.storage_key, "uploads/abc123");
        assert_eq!(*bytes_seen.lock().unwrap(), size as u64);

        let reports = progress.lock().unwrap();
        assert_eq!(reports.first().unwrap().0, 0);
        assert_eq!(reports.last().unwrap().0, 100);
        assert!(
            reports.windows(2).all(|w| w[0].0 <= w[1].0),
            "progress must be non-decreasing: {:?}",
            reports
        );
    }

    #[tokio::test]
    async fn storage_rejection_maps_to_rejected_with_status() {
        let file = write_temp_file(CHUNK_SIZE);
        let transport = Arc::new(DrainingTransport {
            status: 403,
            bytes_seen: Arc::new(Mutex::new(0)),
        });

        let handle = TransferHandle::new(transport);
        let result = handle
            .transfer(&descriptor(file.path(), CHUNK_SIZE as u64), &credential(), |_, _| {})
            .await;

        assert!(matches!(result, Err(TransferError::Rejected { status: 403 })));
    }

    #[tokio::test]
    async fn missing_source_file_is_an_io_error() {
        let transport = Arc::new(DrainingTransport {
            status: 200,
            bytes_seen: Arc::new(Mutex::new(0)),
        });
        let handle = TransferHandle::new(transport);
        let result = handle
            .transfer(
                &descriptor(Path::new("/nonexistent/feature.mp4"), 1),
                &credential(),
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn cancel_mid_flight_rejects_with_cancelled() {
        let file = write_temp_file(CHUNK_SIZE);
        let handle = Arc::new(TransferHandle::new(Arc::new(PendingTransport)));
        let token = handle.cancel_token();

        let worker = handle.clone();
        let file_descriptor = descriptor(file.path(), CHUNK_SIZE as u64);
        let task = tokio::spawn(async move {
            worker
                .transfer(&file_descriptor, &credential(), |_, _| {})
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        // Idempotent: a second cancel changes nothing.
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));

        // And cancelling after settlement is still a no-op.
        token.cancel();
    }

    #[tokio::test]
    async fn second_transfer_on_same_handle_fails_fast() {
        let file = write_temp_file(CHUNK_SIZE);
        let handle = Arc::new(TransferHandle::new(Arc::new(PendingTransport)));

        let worker = handle.clone();
        let file_descriptor = descriptor(file.path(), CHUNK_SIZE as u64);
        let task = tokio::spawn(async move {
            worker
                .transfer(&file_descriptor, &credential(), |_, _| {})
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = handle
            .transfer(&descriptor(file.path(), CHUNK_SIZE as u64), &credential(), |_, _| {})
            .await;
        assert!(matches!(result, Err(TransferError::ConcurrentTransfer)));

        handle.cancel();
        let first = task.await.unwrap();
        assert!(matches!(first, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_before_start_never_touches_the_transport() {
        let file = write_temp_file(16);
        let handle = TransferHandle::new(Arc::new(PendingTransport));
        handle.cancel();

        let result = handle
            .transfer(&descriptor(file.path(), 16), &credential(), |_, _| {})
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}

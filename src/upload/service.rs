use crate::notifications::{BusError, NotificationBus};
use crate::upload::credentials::{CredentialApi, CredentialError};
use crate::upload::policy::{self, ValidationError};
use crate::upload::reconciler::{ProcessingEventLog, Reconciler, ReconcilerHandle};
use crate::upload::store::{FailureKind, UploadLifecycleState, UploadStage, UploadStore};
use crate::upload::transfer::{CancelToken, StorageTransport, TransferError, TransferHandle};
use crate::upload::types::{AssetKind, FileDescriptor, ProcessingEvent};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Umbrella error for one upload attempt.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("upload service is not running")]
    ServiceStopped,
}

/// Requests handled by the upload worker.
enum UploadRequest {
    Begin {
        target_id: u64,
        file: FileDescriptor,
        kind: AssetKind,
    },
}

/// Handle for starting, cancelling and observing uploads.
#[derive(Clone)]
pub struct UploadServiceHandle {
    requests_tx: mpsc::UnboundedSender<UploadRequest>,
    store: UploadStore,
    log: ProcessingEventLog,
    active: Arc<Mutex<Option<CancelToken>>>,
}

impl UploadServiceHandle {
    /// Validate and queue an upload attempt.
    ///
    /// The policy gate runs here, before anything else: a violation is
    /// returned to the caller, the store never leaves `Idle`, and no network
    /// call is made. Everything after validation is reported through the
    /// store (see `subscribe`).
    pub fn begin_upload(
        &self,
        target_id: u64,
        file: FileDescriptor,
        kind: AssetKind,
    ) -> Result<(), UploadError> {
        policy::validate(&file, kind)?;

        // One live transfer per slot: a new attempt displaces whatever is in
        // flight, invalidating its token here so the stalled transfer settles
        // and the worker can pick this request up. The worker processes
        // requests serially, so without this cancel a queued attempt would
        // wait behind a transfer that never ends.
        if let Some(prior) = self.active.lock().unwrap().take() {
            prior.cancel();
        }

        self.requests_tx
            .send(UploadRequest::Begin {
                target_id,
                file,
                kind,
            })
            .map_err(|_| UploadError::ServiceStopped)
    }

    /// Abort the in-flight transfer, if any. Idempotent; a no-op once the
    /// store has left `Uploading`.
    pub fn cancel(&self) {
        if let Some(token) = self.active.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// `failed|completed → idle` between attempts.
    pub fn reset(&self) {
        self.store.reset();
    }

    pub fn state(&self) -> UploadLifecycleState {
        self.store.state()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadLifecycleState> {
        self.store.subscribe()
    }

    /// Processing events observed this session, most recent first.
    pub fn processing_events(&self) -> Vec<ProcessingEvent> {
        self.log.entries()
    }
}

/// Orchestrates one upload at a time: policy gate, credential acquisition,
/// direct transfer with live progress, then hand-off to the reconciler for
/// the asynchronous processing outcome.
pub struct UploadService {
    credentials: Arc<dyn CredentialApi>,
    transport: Arc<dyn StorageTransport>,
    store: UploadStore,
    requests_rx: mpsc::UnboundedReceiver<UploadRequest>,
    active: Arc<Mutex<Option<CancelToken>>>,
}

impl UploadService {
    /// Start the upload worker and wire the reconciler onto the push bus.
    /// Returns the service handle plus the reconciler subscription handle;
    /// the caller owns releasing the latter on teardown.
    pub async fn start(
        credentials: Arc<dyn CredentialApi>,
        transport: Arc<dyn StorageTransport>,
        bus: Arc<dyn NotificationBus>,
    ) -> Result<(UploadServiceHandle, ReconcilerHandle), BusError> {
        let store = UploadStore::new();
        let log = ProcessingEventLog::new();

        let reconciler = Reconciler::new(bus, store.clone(), log.clone());
        let reconciler_handle = reconciler.start().await?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let active = Arc::new(Mutex::new(None));

        let service = UploadService {
            credentials,
            transport,
            store: store.clone(),
            requests_rx,
            active: active.clone(),
        };
        tokio::spawn(service.run());

        Ok((
            UploadServiceHandle {
                requests_tx,
                store,
                log,
                active,
            },
            reconciler_handle,
        ))
    }

    async fn run(mut self) {
        info!("upload worker started");
        while let Some(request) = self.requests_rx.recv().await {
            match request {
                UploadRequest::Begin {
                    target_id,
                    file,
                    kind,
                } => {
                    if let Err(e) = self.handle_begin(target_id, file, kind).await {
                        warn!(target_id, "upload attempt failed: {e}");
                    }
                }
            }
        }
        debug!("request channel closed, upload worker exiting");
    }

    async fn handle_begin(
        &self,
        target_id: u64,
        file: FileDescriptor,
        kind: AssetKind,
    ) -> Result<(), UploadError> {
        if self.store.state().stage != UploadStage::Idle {
            self.store.reset();
        }

        info!(target_id, file_name = %file.file_name, kind = kind.wire_name(), "starting upload");
        self.store.begin_preparing(target_id);

        // Fresh handle per attempt; the credential it consumes is single-use.
        // Its token is registered before the first suspension point so a
        // displacing attempt can always reach it, even mid-credential.
        let handle = TransferHandle::new(self.transport.clone());
        *self.active.lock().unwrap() = Some(handle.cancel_token());

        let credential = match self
            .credentials
            .request_credential(target_id, &file, kind)
            .await
        {
            Ok(credential) => credential,
            Err(e) => {
                self.active.lock().unwrap().take();
                self.store.fail(FailureKind::Credential, e.to_string());
                return Err(e.into());
            }
        };

        self.store.begin_uploading();

        let progress_store = self.store.clone();
        let outcome = handle
            .transfer(&file, &credential, move |percent, bytes| {
                progress_store.record_progress(percent, bytes);
            })
            .await;

        // The attempt has settled either way; release the slot.
        self.active.lock().unwrap().take();

        match outcome {
            Ok(outcome) => {
                debug!(key = %outcome.storage_key, "bytes sent, awaiting processing outcome");
                self.store.enter_processing();
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                self.store.fail(FailureKind::Cancelled, "upload was cancelled");
                Err(e.into())
            }
            Err(e) => {
                self.store.fail(FailureKind::Transfer, e.to_string());
                Err(e.into())
            }
        }
    }
}

use crate::upload::types::ProcessingStatus;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Which part of the pipeline the current upload attempt is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Idle,
    Preparing,
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl UploadStage {
    /// Terminal stages are sticky: only an explicit `reset` leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStage::Completed | UploadStage::Failed)
    }
}

/// User-facing failure classification. Each kind maps to a distinct message;
/// a cancelled upload is not presented as a network failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Credential,
    Transfer,
    Cancelled,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UploadFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Short human-readable reason for the UI.
    pub fn user_message(&self) -> String {
        match self.kind {
            FailureKind::Validation => {
                format!("Your file didn't meet the upload requirements: {}", self.message)
            }
            FailureKind::Credential => "We couldn't start the upload. Please try again.".to_string(),
            FailureKind::Transfer => "The upload failed. Please try again.".to_string(),
            FailureKind::Cancelled => "Upload was cancelled.".to_string(),
            FailureKind::Processing => {
                "The upload finished but processing failed. Please try again.".to_string()
            }
        }
    }
}

/// Snapshot of the upload lifecycle, published to subscribers on every
/// transition. Mutated only through `UploadStore` transition methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLifecycleState {
    pub stage: UploadStage,
    pub progress_percent: u8,
    pub bytes_uploaded: u64,
    pub error: Option<UploadFailure>,
}

impl Default for UploadLifecycleState {
    fn default() -> Self {
        Self {
            stage: UploadStage::Idle,
            progress_percent: 0,
            bytes_uploaded: 0,
            error: None,
        }
    }
}

struct StoreInner {
    state: UploadLifecycleState,
    /// Target id of the attempt currently being tracked. Processing events
    /// for anything else are ignored (notably after `reset`).
    tracked_target: Option<u64>,
    /// Terminal processing outcome that arrived before the store reached
    /// `Processing`. Applied the moment `enter_processing` runs.
    pending_resolution: Option<(ProcessingStatus, Option<String>)>,
    subscribers: Vec<mpsc::UnboundedSender<UploadLifecycleState>>,
}

/// Single source of truth for the in-progress upload.
///
/// Two writers exist: the transfer path (preparing/uploading edges) and the
/// reconciler (processing-terminal edges). Each owns disjoint transitions,
/// illegal edges are rejected here, and terminal stages are sticky, which is
/// the whole concurrency discipline — no ordering is assumed between the
/// transfer callback and push-channel callbacks.
#[derive(Clone)]
pub struct UploadStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for UploadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                state: UploadLifecycleState::default(),
                tracked_target: None,
                pending_resolution: None,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> UploadLifecycleState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn tracked_target(&self) -> Option<u64> {
        self.inner.lock().unwrap().tracked_target
    }

    /// Subscribe to state snapshots. One snapshot per transition; the
    /// subscription is dropped when the receiver is.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadLifecycleState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// `idle → preparing` on an explicit upload start. Begins tracking the
    /// target and clears any leftovers from a previous attempt.
    pub fn begin_preparing(&self, target_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.stage != UploadStage::Idle {
            warn!(
                stage = ?inner.state.stage,
                "begin_preparing ignored: store is not idle"
            );
            return;
        }
        inner.state = UploadLifecycleState {
            stage: UploadStage::Preparing,
            ..UploadLifecycleState::default()
        };
        inner.tracked_target = Some(target_id);
        inner.pending_resolution = None;
        debug!(target_id, "upload preparing");
        Self::publish(&mut inner);
    }

    /// `preparing → uploading` once a credential is in hand.
    pub fn begin_uploading(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.stage != UploadStage::Preparing {
            warn!(
                stage = ?inner.state.stage,
                "begin_uploading ignored: store is not preparing"
            );
            return;
        }
        inner.state.stage = UploadStage::Uploading;
        Self::publish(&mut inner);
    }

    /// Progress while uploading. Monotonic: a stale report with a lower
    /// percent than the current value is dropped.
    pub fn record_progress(&self, percent: u8, bytes_uploaded: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.stage != UploadStage::Uploading {
            return;
        }
        if percent < inner.state.progress_percent {
            return;
        }
        inner.state.progress_percent = percent.min(100);
        inner.state.bytes_uploaded = inner.state.bytes_uploaded.max(bytes_uploaded);
        Self::publish(&mut inner);
    }

    /// `uploading → processing` after the bytes are fully sent. Progress is
    /// pinned at 100. If a terminal processing event already arrived (push
    /// delivery raced the transfer callback), it resolves immediately.
    pub fn enter_processing(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.stage != UploadStage::Uploading {
            warn!(
                stage = ?inner.state.stage,
                "enter_processing ignored: store is not uploading"
            );
            return;
        }
        inner.state.stage = UploadStage::Processing;
        inner.state.progress_percent = 100;
        Self::publish(&mut inner);

        if let Some((status, message)) = inner.pending_resolution.take() {
            debug!("applying buffered processing outcome");
            Self::apply_resolution(&mut inner, status, message);
        }
    }

    /// `preparing|uploading → failed`, the transfer writer's terminal edge.
    /// Progress resets to 0 when leaving `uploading`.
    pub fn fail(&self, kind: FailureKind, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(
            inner.state.stage,
            UploadStage::Preparing | UploadStage::Uploading
        ) {
            warn!(stage = ?inner.state.stage, "fail ignored: no attempt in flight");
            return;
        }
        inner.state.stage = UploadStage::Failed;
        inner.state.progress_percent = 0;
        inner.state.bytes_uploaded = 0;
        inner.state.error = Some(UploadFailure::new(kind, message));
        Self::publish(&mut inner);
    }

    /// Reconciler-driven terminal edge for `target_id`.
    ///
    /// Returns `false` when the event is for a target this store is not
    /// tracking (e.g. after `reset`). Terminal stages are sticky, so a
    /// duplicate resolution is a no-op. Arriving before `processing` buffers
    /// the outcome instead of discarding it.
    pub fn resolve(
        &self,
        target_id: u64,
        status: ProcessingStatus,
        message: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.tracked_target != Some(target_id) {
            debug!(target_id, "processing event for untracked target ignored");
            return false;
        }

        match inner.state.stage {
            UploadStage::Processing => {
                Self::apply_resolution(&mut inner, status, message);
            }
            UploadStage::Completed | UploadStage::Failed => {
                debug!(target_id, "terminal stage is sticky, resolution dropped");
            }
            _ => {
                debug!(target_id, "buffering processing outcome that arrived early");
                inner.pending_resolution = Some((status, message));
            }
        }
        true
    }

    /// `failed|completed → idle`, explicit only. Stops tracking the target,
    /// so late processing events for it are ignored.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = UploadLifecycleState::default();
        inner.tracked_target = None;
        inner.pending_resolution = None;
        Self::publish(&mut inner);
    }

    fn apply_resolution(inner: &mut StoreInner, status: ProcessingStatus, message: Option<String>) {
        match status {
            ProcessingStatus::Completed => {
                inner.state.stage = UploadStage::Completed;
                inner.state.error = None;
            }
            ProcessingStatus::Failed => {
                inner.state.stage = UploadStage::Failed;
                inner.state.error = Some(UploadFailure::new(
                    FailureKind::Processing,
                    message.unwrap_or_else(|| "server-side processing failed".to_string()),
                ));
            }
        }
        Self::publish(inner);
    }

    fn publish(inner: &mut StoreInner) {
        let snapshot = inner.state.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
    }
}

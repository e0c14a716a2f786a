// # Upload Module
//
// Large-media upload pipeline with focused, testable components:
//
// - **Policy**: static per-asset requirements, pure validation gate
// - **Credentials**: single-use presigned write credential acquisition
// - **Transfer**: direct-to-storage streaming with progress and cancellation
// - **Store**: the idle→preparing→uploading→processing→completed/failed
//   lifecycle state machine, single source of truth for the UI
// - **Reconciler**: merges push-channel processing outcomes into the store
// - **Service**: orchestrates one attempt end to end
//
// Public API:
// - `UploadService` / `UploadServiceHandle`: start, cancel, reset, observe
// - `validate` / `requirements`: the policy gate for file selection
// - `UploadStore` / `UploadLifecycleState`: lifecycle state and subscription

mod credentials;
mod policy;
mod reconciler;
mod service;
mod store;
mod transfer;
mod types;

// Public API exports
pub use credentials::{CredentialApi, CredentialError, HttpCredentialApi};
pub use policy::{requirements, validate, UploadRequirement, ValidationError};
pub use reconciler::{
    parse_event, ProcessingEventLog, ReconciliationError, Reconciler, ReconcilerHandle,
    PROCESSING_CHANNEL,
};
pub use service::{UploadError, UploadService, UploadServiceHandle};
pub use store::{FailureKind, UploadFailure, UploadLifecycleState, UploadStage, UploadStore};
pub use transfer::{
    ByteStream, CancelToken, HttpStorageTransport, StorageTransport, TransferError, TransferHandle,
};
pub use types::{
    AssetKind, FileDescriptor, ProcessingEvent, ProcessingStatus, TransferOutcome,
    UploadCredential,
};

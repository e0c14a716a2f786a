use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;

/// Classification of an uploadable file. Selects the requirement table entry
/// and the server route used when requesting a write credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Main,
    Trailer,
    Thumbnail,
}

impl AssetKind {
    /// Name used on the wire (`fileType` field of the presigned-url request).
    pub fn wire_name(&self) -> &'static str {
        match self {
            AssetKind::Main => "main",
            AssetKind::Trailer => "trailer",
            AssetKind::Thumbnail => "thumbnail",
        }
    }
}

/// Everything the policy gate and the credential request need to know about
/// a selected file. Gathered once at selection time; duration is only
/// populated when the client can read it (video/audio kinds).
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub duration_seconds: Option<u32>,
}

/// Single-use write authorization issued by the application server.
///
/// Owned by exactly one transfer attempt and never cached: a retry must
/// request a fresh credential because the URL is time-boxed server-side.
#[derive(Debug, Clone)]
pub struct UploadCredential {
    pub write_url: String,
    pub storage_key: String,
}

/// Result of a fully sent transfer. Does not imply server-side processing
/// finished; that arrives later over the push channel.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub bytes_sent: u64,
    pub storage_key: String,
}

/// Terminal outcome of server-side processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Completed,
    Failed,
}

/// Parsed push-channel event. Appended to the session log in arrival order;
/// no server-assigned sequence number exists, so duplicates and reordering
/// are tolerated by consumers.
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    pub project_id: u64,
    pub project_name: Option<String>,
    pub status: ProcessingStatus,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// The payload exactly as it arrived on the channel, for log inspection.
    pub raw: Value,
}

impl ProcessingEvent {
    /// Identity used to suppress re-applying effects when the same event is
    /// delivered twice (at-least-once channel, or resubscription replay).
    pub fn identity(&self) -> (u64, String, i64) {
        (
            self.project_id,
            self.event_type.clone(),
            self.occurred_at.timestamp_millis(),
        )
    }
}

use crate::notifications::{BusError, NotificationBus};
use crate::upload::store::UploadStore;
use crate::upload::types::{ProcessingEvent, ProcessingStatus};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Push channel carrying server-side processing outcomes.
pub const PROCESSING_CHANNEL: &str = "video-processing";

/// A push event could not be turned into an actionable `ProcessingEvent`.
/// Never surfaced to the user: logged at the reconciler boundary and
/// dropped, leaving the store untouched.
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("event payload does not match the expected shape: {0}")]
    Malformed(String),
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("unrecognized processing status '{0}'")]
    UnknownStatus(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event_type: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    project: Option<RawProject>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    id: Option<u64>,
    name: Option<String>,
    main_upload_status: Option<String>,
}

/// Strictly parse a raw push payload into a tagged event.
pub fn parse_event(raw: &Value) -> Result<ProcessingEvent, ReconciliationError> {
    let envelope: RawEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| ReconciliationError::Malformed(e.to_string()))?;

    let event_type = envelope
        .event_type
        .ok_or_else(|| ReconciliationError::Malformed("missing event_type".to_string()))?;

    match event_type.as_str() {
        "VideoProcessed" => {
            let project = envelope
                .project
                .ok_or_else(|| ReconciliationError::Malformed("missing project".to_string()))?;
            let project_id = project
                .id
                .ok_or_else(|| ReconciliationError::Malformed("missing project.id".to_string()))?;
            let status_raw = project.main_upload_status.ok_or_else(|| {
                ReconciliationError::Malformed("missing project.main_upload_status".to_string())
            })?;
            let status = match status_raw.as_str() {
                "completed" => ProcessingStatus::Completed,
                "failed" => ProcessingStatus::Failed,
                other => return Err(ReconciliationError::UnknownStatus(other.to_string())),
            };

            Ok(ProcessingEvent {
                project_id,
                project_name: project.name,
                status,
                event_type,
                occurred_at: envelope.timestamp.unwrap_or_else(Utc::now),
                raw: raw.clone(),
            })
        }
        other => Err(ReconciliationError::UnknownEventType(other.to_string())),
    }
}

/// Most-recent-first log of processing events observed this session.
/// Duplicates are kept; arrival order is the only ordering guarantee.
#[derive(Clone, Default)]
pub struct ProcessingEventLog {
    entries: Arc<Mutex<Vec<ProcessingEvent>>>,
}

impl ProcessingEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: ProcessingEvent) {
        self.entries.lock().unwrap().insert(0, event);
    }

    pub fn entries(&self) -> Vec<ProcessingEvent> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Merges asynchronous processing outcomes from the push channel into the
/// lifecycle store and the session log.
///
/// Survives restarts: the applied-event identity set lives on the reconciler
/// itself, so resubscribing after a disconnect does not re-apply effects the
/// channel replays.
pub struct Reconciler {
    bus: Arc<dyn NotificationBus>,
    store: UploadStore,
    log: ProcessingEventLog,
    applied: Arc<Mutex<HashSet<(u64, String, i64)>>>,
}

/// Live subscription to the processing channel. `stop` releases the channel
/// subscription and halts the consumer task.
pub struct ReconcilerHandle {
    task: JoinHandle<()>,
    bus: Arc<dyn NotificationBus>,
    channel: String,
    subscription_id: u64,
}

impl ReconcilerHandle {
    pub fn stop(self) {
        self.bus.unsubscribe(&self.channel, self.subscription_id);
        self.task.abort();
        debug!(channel = %self.channel, "reconciler stopped");
    }
}

impl Reconciler {
    pub fn new(bus: Arc<dyn NotificationBus>, store: UploadStore, log: ProcessingEventLog) -> Self {
        Self {
            bus,
            store,
            log,
            applied: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Subscribe to the processing channel and start consuming events.
    pub async fn start(&self) -> Result<ReconcilerHandle, BusError> {
        let subscription = self.bus.subscribe(PROCESSING_CHANNEL).await?;
        info!(channel = PROCESSING_CHANNEL, "reconciler subscribed");

        let store = self.store.clone();
        let log = self.log.clone();
        let applied = self.applied.clone();
        let mut events = subscription.events;

        let task = tokio::spawn(async move {
            while let Some(raw) = events.recv().await {
                match parse_event(&raw) {
                    Ok(event) => apply_event(&store, &log, &applied, event),
                    Err(e) => warn!("dropping unusable processing event: {e}"),
                }
            }
            debug!("processing channel closed, reconciler exiting");
        });

        Ok(ReconcilerHandle {
            task,
            bus: self.bus.clone(),
            channel: subscription.channel,
            subscription_id: subscription.id,
        })
    }
}

/// Log the event, then drive the store exactly once per event identity.
fn apply_event(
    store: &UploadStore,
    log: &ProcessingEventLog,
    applied: &Mutex<HashSet<(u64, String, i64)>>,
    event: ProcessingEvent,
) {
    log.record(event.clone());

    let first_delivery = applied.lock().unwrap().insert(event.identity());
    if !first_delivery {
        debug!(
            project_id = event.project_id,
            "duplicate delivery, effect already applied"
        );
        return;
    }

    let message = match event.status {
        ProcessingStatus::Failed => Some(match &event.project_name {
            Some(name) => format!("processing failed for '{name}'"),
            None => "server-side processing failed".to_string(),
        }),
        ProcessingStatus::Completed => None,
    };

    if store.resolve(event.project_id, event.status, message) {
        info!(
            project_id = event.project_id,
            status = ?event.status,
            "processing outcome reconciled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::store::UploadStage;
    use serde_json::json;

    fn processed_payload(id: u64, status: &str) -> Value {
        json!({
            "project": {
                "id": id,
                "name": "My Film",
                "main_upload_status": status,
            },
            "timestamp": "2024-06-01T12:00:00Z",
            "event_type": "VideoProcessed",
            "channel": "video-processing",
        })
    }

    fn store_in_processing(target_id: u64) -> UploadStore {
        let store = UploadStore::new();
        store.begin_preparing(target_id);
        store.begin_uploading();
        store.enter_processing();
        store
    }

    #[test]
    fn parses_a_video_processed_event() {
        let event = parse_event(&processed_payload(42, "completed")).unwrap();
        assert_eq!(event.project_id, 42);
        assert_eq!(event.status, ProcessingStatus::Completed);
        assert_eq!(event.event_type, "VideoProcessed");
        assert_eq!(event.project_name.as_deref(), Some("My Film"));
        // The full payload rides along for log inspection, untouched.
        assert_eq!(event.raw, processed_payload(42, "completed"));
        assert_eq!(event.raw["channel"], "video-processing");
    }

    #[test]
    fn malformed_payloads_are_errors_not_panics() {
        assert!(matches!(
            parse_event(&json!({"project": {"id": 42}})),
            Err(ReconciliationError::Malformed(_))
        ));
        assert!(matches!(
            parse_event(&json!({"event_type": "VideoProcessed"})),
            Err(ReconciliationError::Malformed(_))
        ));
        assert!(matches!(
            parse_event(&json!({"event_type": "SomethingElse", "project": {"id": 1}})),
            Err(ReconciliationError::UnknownEventType(_))
        ));
        assert!(matches!(
            parse_event(&processed_payload(42, "transcoding")),
            Err(ReconciliationError::UnknownStatus(_))
        ));
    }

    #[test]
    fn duplicate_event_is_logged_but_applied_once() {
        let store = store_in_processing(42);
        let log = ProcessingEventLog::new();
        let applied = Mutex::new(HashSet::new());

        let event = parse_event(&processed_payload(42, "completed")).unwrap();
        apply_event(&store, &log, &applied, event.clone());
        apply_event(&store, &log, &applied, event);

        assert_eq!(store.state().stage, UploadStage::Completed);
        // The duplicate still lands in the log; that is tolerated.
        assert_eq!(log.len(), 2);
        assert_eq!(applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn log_is_most_recent_first() {
        let log = ProcessingEventLog::new();
        log.record(parse_event(&processed_payload(1, "completed")).unwrap());
        log.record(parse_event(&processed_payload(2, "failed")).unwrap());

        let entries = log.entries();
        assert_eq!(entries[0].project_id, 2);
        assert_eq!(entries[1].project_id, 1);
    }

    #[tokio::test]
    async fn consumes_events_from_the_bus_and_drives_the_store() {
        let bus = Arc::new(crate::notifications::InProcessBus::new());
        let store = store_in_processing(42);
        let log = ProcessingEventLog::new();
        let reconciler = Reconciler::new(bus.clone(), store.clone(), log.clone());
        let handle = reconciler.start().await.unwrap();

        bus.publish(PROCESSING_CHANNEL, processed_payload(42, "completed"));
        bus.publish(PROCESSING_CHANNEL, json!({"garbage": true}));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.state().stage, UploadStage::Completed);
        assert_eq!(log.len(), 1);

        handle.stop();
        assert_eq!(bus.subscriber_count(PROCESSING_CHANNEL), 0);
    }

    #[tokio::test]
    async fn resubscribing_does_not_reapply_replayed_events() {
        let bus = Arc::new(crate::notifications::InProcessBus::new());
        let store = store_in_processing(42);
        let log = ProcessingEventLog::new();
        let reconciler = Reconciler::new(bus.clone(), store.clone(), log.clone());

        let handle = reconciler.start().await.unwrap();
        bus.publish(PROCESSING_CHANNEL, processed_payload(42, "failed"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.stop();

        // Channel reconnect replays the same event.
        let handle = reconciler.start().await.unwrap();
        bus.publish(PROCESSING_CHANNEL, processed_payload(42, "failed"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(store.state().stage, UploadStage::Failed);
        assert_eq!(log.len(), 2, "replayed event still logged");
        // One applied identity only.
        assert_eq!(reconciler.applied.lock().unwrap().len(), 1);
        handle.stop();
    }
}

//! EventSink の実装
//!
//! - **TracingSink**: すべてのイベントを tracing に流す（CLI のデフォルト）
//! - **ChannelSink**: mpsc channel に転送する（テストや外部の監視用）
//! - **NoopSink**: 何もしない

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ports::{EngineEvent, EventSink};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::TaskDispatched {
                task,
                worker,
                attempt,
            } => info!(task = %task, worker = %worker, attempt, "task dispatched"),
            EngineEvent::TaskStarted { task, worker } => {
                info!(task = %task, worker = %worker, "task started")
            }
            EngineEvent::TaskCompleted {
                task,
                worker,
                mutations,
            } => info!(task = %task, worker = %worker, mutations, "task completed"),
            EngineEvent::TaskFailed {
                task,
                worker,
                failure,
                will_retry,
            } => warn!(task = %task, worker = %worker, failure = %failure, will_retry, "task failed"),
            EngineEvent::TaskDeferred { task, reason } => {
                info!(task = %task, reason = %reason, "task deferred")
            }
            EngineEvent::CancelRequested => warn!("batch cancel requested"),
            EngineEvent::ConflictResolved { conflict } => info!(
                artifact = %conflict.artifact_id,
                rule = conflict.rule.number(),
                winner = ?conflict.winner.as_ref().map(|w| w.as_str()),
                losers = conflict.losers.len(),
                "conflict resolved"
            ),
            EngineEvent::BatchCommitted { batch, mutations } => {
                info!(batch = %batch, mutations, "batch committed")
            }
            EngineEvent::BatchRolledBack { batch, failure } => warn!(
                batch = %batch,
                task = %failure.task_id,
                artifact = %failure.artifact_id,
                error = %failure.error,
                "batch rolled back"
            ),
        }
    }
}

/// Forwards events to an unbounded channel. Events sent after the receiver
/// is dropped are discarded.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: EngineEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(EngineEvent::CancelRequested);
        sink.emit(EngineEvent::TaskStarted {
            task: TaskId::new("a"),
            worker: "w1".into(),
        });

        assert_eq!(rx.recv().await, Some(EngineEvent::CancelRequested));
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::TaskStarted { .. })
        ));
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(EngineEvent::CancelRequested);
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.emit(EngineEvent::CancelRequested);
        sink.emit(EngineEvent::TaskDeferred {
            task: TaskId::new("a"),
            reason: crate::domain::DeferReason::BatchCancelled,
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], EngineEvent::CancelRequested);
    }

    #[test]
    fn events_serialize_with_tag() {
        let v = serde_json::to_value(EngineEvent::CancelRequested).unwrap();
        assert_eq!(v["event"], "cancel_requested");
    }
}

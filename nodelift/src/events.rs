//! Events the core publishes about its decisions

use crate::api::Uid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Something the autoscaler decided or observed, for operators to see
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A pending pod was pointed at a node that can take it
    NominatePod { pod: Uid, node: String },
    /// A pod could not be placed anywhere
    PodFailedToSchedule { pod: Uid, reason: String },
    /// A replacement node is being created
    Launching { node_claim: String, reason: String },
    /// Waiting for a replacement to become ready
    WaitingOnReadiness { node_claim: String },
    /// A node is being removed
    Terminating { node: String, reason: String },
    /// A candidate could not be disrupted
    Blocked { node: String, reason: String },
    /// A node cannot be consolidated, with the reason text
    Unconsolidatable { node: String, reason: String },
    /// A pool's budget currently blocks a disruption reason
    NodePoolBlockedForDisruptionReason { node_pool: String, reason: String },
}

/// Sink for published events
pub trait EventRecorder: Send + Sync {
    fn publish(&self, event: Event);
}

/// Default recorder that writes events to the log
#[derive(Debug, Default)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn publish(&self, event: Event) {
        info!(?event, "event");
    }
}

/// Recorder that retains events for inspection, for tests
#[derive(Debug, Default)]
pub struct RecordingRecorder {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl RecordingRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Text of every `Unconsolidatable` event seen
    pub fn unconsolidatable_reasons(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Unconsolidatable { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }
}

impl EventRecorder for RecordingRecorder {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}

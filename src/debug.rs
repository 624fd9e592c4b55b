//! Debug-inspection sink for store actions.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Receives a record of every committed write. Must not block.
pub trait DebugSink: Send + Sync {
    fn record_action(&self, label: &str, payload: &Value, diff: Option<&Value>);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDebugSink;

impl DebugSink for NoopDebugSink {
    fn record_action(&self, _label: &str, _payload: &Value, _diff: Option<&Value>) {}
}

/// One recorded action.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordedAction {
    pub label: String,
    pub payload: Value,
    pub diff: Option<Value>,
}

/// Keeps recorded actions in memory for inspection.
#[derive(Default)]
pub struct MemoryDebugSink {
    actions: Mutex<Vec<RecordedAction>>,
}

impl MemoryDebugSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions recorded so far, oldest first.
    pub fn actions(&self) -> Vec<RecordedAction> {
        self.actions.lock().clone()
    }

    /// Labels of recorded actions, oldest first.
    pub fn labels(&self) -> Vec<String> {
        self.actions
            .lock()
            .iter()
            .map(|action| action.label.clone())
            .collect()
    }
}

impl DebugSink for MemoryDebugSink {
    fn record_action(&self, label: &str, payload: &Value, diff: Option<&Value>) {
        self.actions.lock().push(RecordedAction {
            label: label.to_string(),
            payload: payload.clone(),
            diff: diff.cloned(),
        });
    }
}

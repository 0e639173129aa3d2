//! Fire-and-forget execution metrics.

use async_trait::async_trait;
use relay_core::ErrorKind;
use serde::Serialize;
use std::sync::Mutex;
use sysinfo::{ProcessesToUpdate, System};
use tracing::info;

/// One executor call as seen by an external metrics sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub tool: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub trace_id: String,
    pub duration_ms: u64,
    /// Change in resident memory of this process across the call, when known.
    pub memory_delta_bytes: Option<i64>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
}

/// External metrics sink. Called on a detached task; whatever it does
/// cannot affect the executor's result.
#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    async fn record(&self, record: ExecutionRecord);
}

/// Writes each record to the log.
pub struct LogTracker;

#[async_trait]
impl ExecutionTracker for LogTracker {
    async fn record(&self, record: ExecutionRecord) {
        info!(
            tool = %record.tool,
            trace_id = %record.trace_id,
            duration_ms = record.duration_ms,
            memory_delta_bytes = record.memory_delta_bytes,
            success = record.success,
            error_kind = record.error_kind.map(|k| k.as_str()),
            "Tool executed"
        );
    }
}

/// Samples resident memory of the current process.
pub struct MemoryProbe {
    system: Mutex<System>,
    pid: Option<sysinfo::Pid>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system.process(pid).map(|p| p.memory())
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed difference between two samples.
pub fn memory_delta(before: Option<u64>, after: Option<u64>) -> Option<i64> {
    match (before, after) {
        (Some(b), Some(a)) => Some(a as i64 - b as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_needs_both_samples() {
        assert_eq!(memory_delta(Some(100), Some(150)), Some(50));
        assert_eq!(memory_delta(Some(150), Some(100)), Some(-50));
        assert_eq!(memory_delta(None, Some(100)), None);
    }

    #[test]
    fn record_serializes_kind() {
        let record = ExecutionRecord {
            tool: "projects.list".into(),
            user_id: Some("u1".into()),
            tenant_id: None,
            trace_id: "tr-1".into(),
            duration_ms: 12,
            memory_delta_bytes: None,
            success: false,
            error_kind: Some(ErrorKind::Timeout),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["error_kind"], "TIMEOUT");
    }

    #[tokio::test]
    async fn log_tracker_accepts_records() {
        LogTracker
            .record(ExecutionRecord {
                tool: "echo".into(),
                user_id: None,
                tenant_id: None,
                trace_id: "tr-2".into(),
                duration_ms: 1,
                memory_delta_bytes: Some(0),
                success: true,
                error_kind: None,
            })
            .await;
    }
}

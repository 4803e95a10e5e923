use crate::domain::model::{PhaseEvent, PhaseStatus};
use crate::domain::ports::AuditSink;
use std::sync::{Arc, Mutex};

/// 以結構化日誌輸出每個階段事件（target = "audit"）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &PhaseEvent) {
        match event.status {
            PhaseStatus::Completed => tracing::info!(
                target: "audit",
                phase = %event.phase,
                status = "completed",
                duration_ms = event.duration_ms,
                records_affected = event.records_affected,
                started_at = %event.started_at.to_rfc3339(),
                "phase transition"
            ),
            PhaseStatus::Failed => tracing::warn!(
                target: "audit",
                phase = %event.phase,
                status = "failed",
                duration_ms = event.duration_ms,
                records_affected = event.records_affected,
                started_at = %event.started_at.to_rfc3339(),
                "phase transition"
            ),
        }
    }
}

/// 記憶體內收集事件，供測試與報告使用
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<PhaseEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &PhaseEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn emit(&self, event: &PhaseEvent) {
        (**self).emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Phase;
    use chrono::Utc;

    #[test]
    fn test_memory_sink_shared_through_arc() {
        let sink = Arc::new(MemoryAuditSink::new());
        let shared: Arc<MemoryAuditSink> = Arc::clone(&sink);

        let now = Utc::now();
        shared.emit(&PhaseEvent {
            phase: Phase::Extract,
            status: PhaseStatus::Completed,
            duration_ms: 12,
            records_affected: 3,
            started_at: now,
            finished_at: now,
        });
        TracingAuditSink.emit(&sink.events()[0]);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, Phase::Extract);
        assert_eq!(events[0].records_affected, 3);
    }
}

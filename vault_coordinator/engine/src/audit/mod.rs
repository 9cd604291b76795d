use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::NodeIndex;

/// Type of coordination event being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    KeyGen,
    Derivation,
    Signing,
    Aggregation,
    Error,
}

/// Record of a coordination event
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub session_id: String,
    pub node: Option<NodeIndex>,
    pub message: String,
    pub timestamp: String, // RFC3339
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, session_id: &str, message: impl Into<String>) -> Self {
        AuditRecord {
            event_type,
            session_id: session_id.to_string(),
            node: None,
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_node(mut self, node: NodeIndex) -> Self {
        self.node = Some(node);
        self
    }

    pub fn event_type_label(&self) -> &'static str {
        match self.event_type {
            AuditEventType::KeyGen => "KEYGEN",
            AuditEventType::Derivation => "DERIVE",
            AuditEventType::Signing => "SIGNING",
            AuditEventType::Aggregation => "AGGREGATE",
            AuditEventType::Error => "ERROR",
        }
    }
}

/// In-memory audit tracker, bounded; the oldest record is evicted first.
pub struct AuditTracker {
    records: Mutex<VecDeque<AuditRecord>>,
    max_entries: usize,
}

impl AuditTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    /// Record a new event in the audit log
    pub fn log(&self, record: AuditRecord) {
        tracing::debug!(
            event = record.event_type_label(),
            session_id = %record.session_id,
            node = ?record.node.map(|n| n.0),
            "audit: {}",
            record.message
        );

        if self.max_entries == 0 {
            return;
        }
        // a poisoned lock only means another thread panicked mid-push; the deque is intact
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.max_entries {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records first
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditTracker {
    fn default() -> Self {
        AuditTracker::new(500)
    }
}

/// Helper to get current timestamp as RFC3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_adds_and_retrieves() {
        let tracker = AuditTracker::new(10);

        tracker.log(
            AuditRecord::new(AuditEventType::KeyGen, "session_1", "Generated key")
                .with_node(NodeIndex(2)),
        );

        let recent = tracker.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].session_id, "session_1");
        assert_eq!(recent[0].message, "Generated key");
        assert_eq!(recent[0].node, Some(NodeIndex(2)));
        assert_eq!(recent[0].event_type_label(), "KEYGEN");
    }

    #[test]
    fn test_audit_log_eviction() {
        let tracker = AuditTracker::new(3);

        for i in 0..5 {
            tracker.log(AuditRecord::new(
                AuditEventType::Signing,
                &format!("session_{}", i),
                format!("Signed run {}", i),
            ));
        }

        let recent = tracker.recent(5);
        assert_eq!(recent.len(), 3); // oldest two evicted
        assert_eq!(recent[0].session_id, "session_4");
        assert_eq!(recent[2].session_id, "session_2");
    }

    #[test]
    fn test_audit_log_thread_safety() {
        use std::thread;

        let tracker = AuditTracker::new(100);

        thread::scope(|s| {
            for i in 0..10 {
                let tracker = &tracker;
                s.spawn(move || {
                    tracker.log(
                        AuditRecord::new(
                            AuditEventType::Aggregation,
                            &format!("thread_{}", i),
                            format!("Thread event {}", i),
                        )
                        .with_node(NodeIndex(i)),
                    );
                });
            }
        });

        assert_eq!(tracker.recent(10).len(), 10);
        assert_eq!(tracker.len(), 10);
    }
}

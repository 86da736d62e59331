//! Audit trail for key management operations
//!
//! Every operator action that changes key state leaves an audit event, so a
//! rotation can be reconstructed after the fact: what was prepared, what was
//! rotated with which counters, and when the active version flipped.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Audit event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    VersionPrepared {
        version: u32,
        key_identifier: Option<String>,
        timestamp: DateTime<Utc>,
    },
    RotationCompleted {
        job_id: Uuid,
        target_version: u32,
        processed: u64,
        failed: u64,
        success: bool,
        timestamp: DateTime<Utc>,
    },
    VersionActivated {
        version: u32,
        previous: Option<u32>,
        timestamp: DateTime<Utc>,
    },
}

/// In-process audit logger.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    enabled: bool,
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Record an audit event.
    pub fn record(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }

        tracing::info!("audit: {:?}", event);
        self.events.write().push(event);
    }

    /// Most recent events, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read();
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_events_in_order() {
        let logger = AuditLogger::new(true);

        logger.record(AuditEvent::VersionPrepared {
            version: 2,
            key_identifier: None,
            timestamp: Utc::now(),
        });
        logger.record(AuditEvent::VersionActivated {
            version: 2,
            previous: Some(1),
            timestamp: Utc::now(),
        });

        assert_eq!(logger.event_count(), 2);
        let recent = logger.recent(1);
        assert!(matches!(
            recent[0],
            AuditEvent::VersionActivated { version: 2, .. }
        ));
    }

    #[test]
    fn test_disabled_logger_drops_events() {
        let logger = AuditLogger::new(false);
        logger.record(AuditEvent::VersionPrepared {
            version: 2,
            key_identifier: None,
            timestamp: Utc::now(),
        });
        assert_eq!(logger.event_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::RotationCompleted {
            job_id: Uuid::new_v4(),
            target_version: 2,
            processed: 120,
            failed: 0,
            success: true,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "rotation_completed");
        assert_eq!(json["processed"], 120);

        let restored: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(restored, event);
    }
}

//! Timestamped TX/RX records handed to the log sink

use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDirection {
    Sent,
    Received,
}

impl RecordDirection {
    pub fn tag(self) -> &'static str {
        match self {
            RecordDirection::Sent => "TX",
            RecordDirection::Received => "RX",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub direction: RecordDirection,
    pub payload: String,
}

impl LogRecord {
    pub fn new(direction: RecordDirection, payload: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            direction,
            payload: payload.into(),
        }
    }

    pub fn sent(payload: impl Into<String>) -> Self {
        Self::new(RecordDirection::Sent, payload)
    }

    pub fn received(payload: impl Into<String>) -> Self {
        Self::new(RecordDirection::Received, payload)
    }

    /// Received record stamped with the time the bytes came off the port.
    pub fn received_at(payload: impl Into<String>, timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            direction: RecordDirection::Received,
            payload: payload.into(),
        }
    }
}

/// Render a record the way the operator log shows it: `[HH:MM:SS.mmm] TX: payload`
pub fn format_line(record: &LogRecord) -> String {
    format!(
        "[{}] {}: {}",
        record.timestamp.format("%H:%M:%S%.3f"),
        record.direction.tag(),
        record.payload
    )
}

//! Shared connection status handle.
//!
//! The connector task writes it; the health probe and supervisor read it.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, TimeZone, Utc};

/// Connection state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected = 0,
    Authenticating = 1,
    Subscribing = 2,
    Streaming = 3,
    Backoff = 4,
    Stopping = 5,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Stopping => "stopping",
        }
    }

    fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Subscribing,
            3 => ConnectionState::Streaming,
            4 => ConnectionState::Backoff,
            5 => ConnectionState::Stopping,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Lock-free view of the connector, safe to read from any task.
#[derive(Debug, Default)]
pub struct ConnectorStatus {
    state: AtomicU8,
    last_frame_unix_ms: AtomicI64,
    reconnects: AtomicU64,
}

impl ConnectorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        match self.last_frame_unix_ms.load(Ordering::Relaxed) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    pub(crate) fn mark_frame(&self, at: DateTime<Utc>) {
        self.last_frame_unix_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

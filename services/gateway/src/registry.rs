//! Process-wide registry of active device sessions.
//!
//! Feeds the read-only stats endpoint. Entries appear once a device has
//! identified itself (login for Jimi, first frame for Ruptela) and vanish
//! on disconnect. Counters are updated from the owning connection worker
//! only; the registry lock is never held across I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-session counters exposed by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub imei: String,
    pub protocol: String,
    pub source_port: u16,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    pub frames: u64,
    pub fixes_emitted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fix: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionStats>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device session. A reconnecting device replaces its old
    /// entry.
    pub fn register(&self, imei: &str, protocol: &str, source_port: u16, remote_addr: String) {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        map.insert(
            imei.to_owned(),
            SessionStats {
                imei: imei.to_owned(),
                protocol: protocol.to_owned(),
                source_port,
                remote_addr,
                connected_at: Utc::now(),
                frames: 0,
                fixes_emitted: 0,
                last_fix: None,
            },
        );
    }

    pub fn unregister(&self, imei: &str) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .remove(imei);
    }

    pub fn record_frame(&self, imei: &str) {
        if let Some(s) = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get_mut(imei)
        {
            s.frames += 1;
        }
    }

    pub fn record_fix(&self, imei: &str, at: DateTime<Utc>) {
        if let Some(s) = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get_mut(imei)
        {
            s.fixes_emitted += 1;
            s.last_fix = Some(at);
        }
    }

    /// Snapshot of all active sessions, sorted by IMEI for stable output.
    pub fn snapshot(&self) -> Vec<SessionStats> {
        let mut out: Vec<SessionStats> = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.imei.cmp(&b.imei));
        out
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }
}

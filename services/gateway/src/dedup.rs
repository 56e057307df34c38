//! Per-device duplicate suppression.
//!
//! Trackers re-send records after missed ACKs and battery brownouts, so the
//! same position routinely arrives two or three times. Each device gets a
//! bounded window of recently seen record fingerprints; a fingerprint hit
//! suppresses emission but refreshes the entry's recency.
//!
//! The window lives for the process lifetime and is only touched from the
//! fan-out path, under a plain mutex — nothing blocks while holding it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tg_protocol::TelemetryFix;

/// Fingerprints retained per IMEI.
pub const WINDOW_SIZE: usize = 100;

/// Process-wide recent-records window, keyed by IMEI.
#[derive(Debug, Default)]
pub struct RecentWindow {
    inner: Mutex<HashMap<String, VecDeque<String>>>,
}

impl RecentWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint: timestamp and the coordinates at 6 decimal places.
    fn fingerprint(fix: &TelemetryFix) -> String {
        format!(
            "{}|{:.6}|{:.6}",
            fix.timestamp.timestamp(),
            fix.latitude,
            fix.longitude
        )
    }

    /// Returns true when the fix is fresh and should be emitted. A
    /// duplicate returns false and moves its fingerprint back to the
    /// most-recent position.
    pub fn check_and_insert(&self, fix: &TelemetryFix) -> bool {
        let key = Self::fingerprint(fix);
        let mut map = self.inner.lock().expect("recent window lock poisoned");
        let window = map.entry(fix.imei.clone()).or_default();
        let fresh = match window.iter().position(|k| *k == key) {
            Some(at) => {
                window.remove(at);
                false
            }
            None => true,
        };
        window.push_back(key);
        while window.len() > WINDOW_SIZE {
            window.pop_front();
        }
        fresh
    }

    /// Number of devices currently tracked (stats only).
    pub fn device_count(&self) -> usize {
        self.inner.lock().expect("recent window lock poisoned").len()
    }
}

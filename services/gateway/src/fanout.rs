//! Subscriber fan-out.
//!
//! One [`SubscriberSet`] exists per process. Subscribers attach
//! unauthenticated, present the shared token to start receiving, and are
//! dropped the moment their push channel closes. Delivery uses `try_send`:
//! a slow subscriber loses messages, never stalls the producer, and a dead
//! one is removed on the spot.
//!
//! The set is guarded by a plain mutex; senders are cloned out and the
//! actual sends happen after the lock is released.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tg_protocol::PushMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-subscriber channel capacity before messages are shed.
const SUBSCRIBER_QUEUE: usize = 256;

struct Subscriber {
    tx: mpsc::Sender<PushMessage>,
    authenticated: bool,
}

/// The process-wide set of push subscribers.
pub struct SubscriberSet {
    token_digest: [u8; 32],
    inner: Mutex<HashMap<Uuid, Subscriber>>,
}

impl SubscriberSet {
    pub fn new(token: &str) -> Self {
        SubscriberSet {
            token_digest: Sha256::digest(token.as_bytes()).into(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a new, unauthenticated subscriber. The returned receiver is
    /// the push channel; it stays silent until authentication.
    pub fn attach(&self) -> (Uuid, mpsc::Receiver<PushMessage>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .expect("subscriber set lock poisoned")
            .insert(
                id,
                Subscriber {
                    tx,
                    authenticated: false,
                },
            );
        debug!(subscriber = %id, "subscriber attached");
        (id, rx)
    }

    /// Validate the presented token; flips the subscriber to authenticated
    /// on success.
    pub fn authenticate(&self, id: Uuid, token: &str) -> bool {
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        let ok = presented == self.token_digest;
        if ok {
            if let Some(sub) = self
                .inner
                .lock()
                .expect("subscriber set lock poisoned")
                .get_mut(&id)
            {
                sub.authenticated = true;
            }
        } else {
            warn!(subscriber = %id, "subscriber presented a bad token");
        }
        ok
    }

    pub fn detach(&self, id: Uuid) {
        self.inner
            .lock()
            .expect("subscriber set lock poisoned")
            .remove(&id);
    }

    /// Deliver to every authenticated subscriber with room in its channel.
    /// Returns the number of successful deliveries.
    pub fn publish(&self, msg: &PushMessage) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<PushMessage>)> = {
            let map = self.inner.lock().expect("subscriber set lock poisoned");
            map.iter()
                .filter(|(_, s)| s.authenticated)
                .map(|(id, s)| (*id, s.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Lagging subscriber: shed this message, keep the
                    // subscription.
                    debug!(subscriber = %id, "subscriber lagging, message shed");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut map = self.inner.lock().expect("subscriber set lock poisoned");
            for id in dead {
                map.remove(&id);
                debug!(subscriber = %id, "subscriber channel closed, removed");
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("subscriber set lock poisoned").len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.inner
            .lock()
            .expect("subscriber set lock poisoned")
            .values()
            .filter(|s| s.authenticated)
            .count()
    }
}

// Hearth
//
// Copyright 2023 Tim Hughey
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Characteristic change subscriptions and out-of-band event delivery.
//!
//! Each verified connection registers an unbounded channel; `notify`
//! enqueues one event body per current subscriber and never waits, so a
//! slow or unreachable subscriber cannot block the producing accessory.
//! Delivery to a connection that already closed is a no-op.

use crate::model::{ChangeSink, Characteristic, Value};
use bytes::Bytes;
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
};
use tokio::sync::mpsc;
use tracing::debug;

pub type ConnId = u64;

/// (aid, iid) pair addressing one characteristic.
pub type CharId = (u64, u64);

#[derive(Default)]
struct Inner {
    chars: HashMap<CharId, CharEntry>,
    conns: HashMap<ConnId, ConnEntry>,
}

struct CharEntry {
    characteristic: Arc<dyn Characteristic>,
    subscribers: HashSet<ConnId>,
}

struct ConnEntry {
    tx: mpsc::UnboundedSender<Bytes>,
    subscriptions: HashSet<CharId>,
}

#[derive(Default)]
pub struct SubscriptionManager {
    inner: Mutex<Inner>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection's event channel. The receiving half lives in
    /// the connection task, which frames each body as an `EVENT/1.0`
    /// message through its own session cipher.
    pub fn register(&self, conn: ConnId) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.lock().unwrap().conns.insert(
            conn,
            ConnEntry {
                tx,
                subscriptions: HashSet::new(),
            },
        );

        rx
    }

    /// Add `conn` to the characteristic's subscriber set. The set is
    /// duplicate-free; re-subscribing is a no-op. The first subscriber
    /// installs the change sink on the characteristic.
    pub fn subscribe(
        self: &Arc<Self>,
        char_id: CharId,
        conn: ConnId,
        characteristic: &Arc<dyn Characteristic>,
    ) {
        let install = {
            let mut inner = self.inner.lock().unwrap();

            let Some(entry) = inner.conns.get_mut(&conn) else {
                return; // connection already gone
            };
            entry.subscriptions.insert(char_id);

            let entry = inner.chars.entry(char_id).or_insert_with(|| CharEntry {
                characteristic: characteristic.clone(),
                subscribers: HashSet::new(),
            });
            let first = entry.subscribers.is_empty();
            entry.subscribers.insert(conn);

            first
        };

        // install outside the lock: the capability may call the sink
        // synchronously
        if install {
            let weak = Arc::downgrade(self);
            let sink: ChangeSink = Arc::new(move |aid, iid, value| {
                if let Some(manager) = Weak::upgrade(&weak) {
                    manager.notify((aid, iid), value);
                }
            });

            characteristic.subscribe(sink);
        }

        debug!("subscribed conn {conn} to {char_id:?}");
    }

    /// Remove `conn` from the characteristic's subscriber set; the last
    /// subscriber leaving uninstalls the change sink.
    pub fn unsubscribe(&self, char_id: CharId, conn: ConnId) {
        let release = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(entry) = inner.conns.get_mut(&conn) {
                entry.subscriptions.remove(&char_id);
            }

            let empty = match inner.chars.get_mut(&char_id) {
                Some(entry) => {
                    entry.subscribers.remove(&conn);
                    entry.subscribers.is_empty()
                }
                None => false,
            };

            if empty {
                inner.chars.remove(&char_id).map(|e| e.characteristic)
            } else {
                None
            }
        };

        if let Some(characteristic) = release {
            characteristic.unsubscribe();
        }
    }

    /// Drop everything the connection owned. Idempotent; safe to call
    /// from both the error path and an explicit stop.
    pub fn remove_connection(&self, conn: ConnId) {
        let released = {
            let mut inner = self.inner.lock().unwrap();
            purge(&mut inner, conn)
        };

        for characteristic in released {
            characteristic.unsubscribe();
        }
    }

    /// Fan one characteristic change out to its current subscribers.
    /// Fire-and-forget: a closed receiver is pruned, never an error.
    pub fn notify(&self, char_id: CharId, value: Value) {
        let body = event_body(char_id, &value);

        let released = {
            let mut inner = self.inner.lock().unwrap();

            let Some(entry) = inner.chars.get(&char_id) else {
                return;
            };

            let mut closed = Vec::new();

            for conn in &entry.subscribers {
                let delivered = inner
                    .conns
                    .get(conn)
                    .is_some_and(|c| c.tx.send(body.clone()).is_ok());

                if !delivered {
                    closed.push(*conn);
                }
            }

            let mut released = Vec::new();
            for conn in closed {
                debug!("pruning closed subscriber {conn}");
                released.extend(purge(&mut inner, conn));
            }

            released
        };

        for characteristic in released {
            characteristic.unsubscribe();
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, char_id: CharId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .chars
            .get(&char_id)
            .map_or(0, |e| e.subscribers.len())
    }
}

/// Detach `conn` from every subscriber set, returning the
/// characteristics whose last subscriber just left.
fn purge(inner: &mut Inner, conn: ConnId) -> Vec<Arc<dyn Characteristic>> {
    let mut released = Vec::new();

    let Some(entry) = inner.conns.remove(&conn) else {
        return released;
    };

    for char_id in entry.subscriptions {
        if let Some(chars) = inner.chars.get_mut(&char_id) {
            chars.subscribers.remove(&conn);

            if chars.subscribers.is_empty() {
                if let Some(e) = inner.chars.remove(&char_id) {
                    released.push(e.characteristic);
                }
            }
        }
    }

    released
}

fn event_body(char_id: CharId, value: &Value) -> Bytes {
    let body = json!({
        "characteristics": [{ "aid": char_id.0, "iid": char_id.1, "value": value }]
    });

    Bytes::from(body.to_string())
}

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

//! Accessory / characteristic model contract.
//!
//! The concrete domain model (thermostat, smoke sensor, window covering)
//! lives in the embedding application. The core needs exactly this much:
//! an addressable tree, awaitable reads and writes, and a two-method
//! change-notification capability per event-capable characteristic.

use crate::Error;
use futures::future::BoxFuture;
use std::sync::Arc;

pub type Value = serde_json::Value;

/// Change-notification sink handed to a characteristic via
/// [`Characteristic::subscribe`]; called with (aid, iid, new value).
pub type ChangeSink = Arc<dyn Fn(u64, u64, Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub events: bool,
}

impl Perms {
    pub const READ_ONLY: Perms = Perms {
        read: true,
        write: false,
        events: false,
    };
    pub const READ_WRITE_EVENTS: Perms = Perms {
        read: true,
        write: true,
        events: true,
    };

    #[must_use]
    pub fn as_strs(&self) -> Vec<&'static str> {
        let mut out = Vec::with_capacity(3);

        if self.read {
            out.push("pr");
        }
        if self.write {
            out.push("pw");
        }
        if self.events {
            out.push("ev");
        }

        out
    }
}

/// One individually addressable property of an accessory.
///
/// Reads and writes may be long-latency device I/O; they return futures so
/// one slow characteristic cannot stall unrelated connections. Both must
/// be cancel-safe.
pub trait Characteristic: Send + Sync {
    fn iid(&self) -> u64;

    /// Short characteristic type identifier, e.g. `"25"` for on/off.
    fn type_id(&self) -> &str;

    /// Wire format: `bool`, `int`, `float` or `string`.
    fn format(&self) -> &str;

    fn perms(&self) -> Perms;

    fn read(&self) -> BoxFuture<'_, Result<Value, Error>>;

    fn write(&self, value: Value) -> BoxFuture<'_, Result<(), Error>>;

    /// Install the change sink. Inert by default for characteristics that
    /// cannot signal changes.
    fn subscribe(&self, _sink: ChangeSink) {}

    fn unsubscribe(&self) {}
}

pub struct Service {
    pub iid: u64,
    pub type_id: String,
    pub characteristics: Vec<Arc<dyn Characteristic>>,
}

pub trait Accessory: Send + Sync {
    fn aid(&self) -> u64;

    fn label(&self) -> &str;

    fn services(&self) -> Vec<Service>;
}

/// The registered accessory tree, shared read-only across connections.
#[derive(Default)]
pub struct Model {
    accessories: Vec<Arc<dyn Accessory>>,
}

impl Model {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, accessory: Arc<dyn Accessory>) -> &mut Self {
        self.accessories.push(accessory);
        self
    }

    #[must_use]
    pub fn accessories(&self) -> &[Arc<dyn Accessory>] {
        &self.accessories
    }

    #[must_use]
    pub fn characteristic(&self, aid: u64, iid: u64) -> Option<Arc<dyn Characteristic>> {
        self.accessories
            .iter()
            .filter(|a| a.aid() == aid)
            .flat_map(|a| a.services())
            .flat_map(|s| s.characteristics)
            .find(|c| c.iid() == iid)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Accessory, ChangeSink, Characteristic, Model, Perms, Service, Value};
    use crate::Error;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// A switch with one on/off characteristic, shared by the router and
    /// subscription tests.
    pub(crate) struct Switch {
        aid: u64,
        pub on: Arc<OnOff>,
    }

    pub(crate) struct OnOff {
        pub state: Mutex<bool>,
        pub sink: Mutex<Option<ChangeSink>>,
        pub fail_reads: bool,
    }

    impl Switch {
        pub(crate) fn build(aid: u64) -> Self {
            Self {
                aid,
                on: Arc::new(OnOff {
                    state: Mutex::new(false),
                    sink: Mutex::new(None),
                    fail_reads: false,
                }),
            }
        }

        pub(crate) fn build_failing(aid: u64) -> Self {
            Self {
                aid,
                on: Arc::new(OnOff {
                    state: Mutex::new(false),
                    sink: Mutex::new(None),
                    fail_reads: true,
                }),
            }
        }
    }

    impl Characteristic for OnOff {
        fn iid(&self) -> u64 {
            9
        }

        fn type_id(&self) -> &str {
            "25"
        }

        fn format(&self) -> &str {
            "bool"
        }

        fn perms(&self) -> Perms {
            Perms::READ_WRITE_EVENTS
        }

        fn read(&self) -> BoxFuture<'_, Result<Value, Error>> {
            Box::pin(async move {
                if self.fail_reads {
                    return Err(Error::AccessoryOperation("device unreachable".into()));
                }

                Ok(json!(*self.state.lock().unwrap()))
            })
        }

        fn write(&self, value: Value) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async move {
                let on = value
                    .as_bool()
                    .ok_or_else(|| Error::AccessoryOperation("expected bool".into()))?;

                *self.state.lock().unwrap() = on;

                Ok(())
            })
        }

        fn subscribe(&self, sink: ChangeSink) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn unsubscribe(&self) {
            *self.sink.lock().unwrap() = None;
        }
    }

    impl Accessory for Switch {
        fn aid(&self) -> u64 {
            self.aid
        }

        fn label(&self) -> &str {
            "Test Switch"
        }

        fn services(&self) -> Vec<Service> {
            vec![Service {
                iid: 8,
                type_id: "49".into(),
                characteristics: vec![self.on.clone()],
            }]
        }
    }

    #[test]
    fn can_find_characteristics_by_address() {
        let mut model = Model::new();
        model.add(Arc::new(Switch::build(1)));
        model.add(Arc::new(Switch::build(2)));

        assert!(model.characteristic(1, 9).is_some());
        assert!(model.characteristic(2, 9).is_some());
        assert!(model.characteristic(3, 9).is_none());
        assert!(model.characteristic(1, 77).is_none());
    }

    #[tokio::test]
    async fn reads_and_writes_flow_through_the_contract() {
        let switch = Switch::build(1);

        assert_eq!(switch.on.read().await.unwrap(), json!(false));

        switch.on.write(json!(true)).await.unwrap();
        assert_eq!(switch.on.read().await.unwrap(), json!(true));

        let res = switch.on.write(json!("nope")).await;
        assert!(matches!(res, Err(Error::AccessoryOperation(_))));
    }
}

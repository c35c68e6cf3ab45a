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

//! Authenticated request router.
//!
//! Dispatches accessory listing, batch characteristic reads/writes and
//! pairing management. Transport encryption is not this layer's concern;
//! the connection state machine gates entry. A malformed body yields a
//! client error response, never a connection drop.

use crate::{
    events::{CharId, ConnId, SubscriptionManager},
    http::{Method, Request, Response},
    model::{Characteristic, Model, Value},
    pair::{self, method},
    registry::{PairingIdentity, PairingListener, Registry, PERM_ADMIN},
    tags::{Idx, Val},
    Tags,
};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

// Per-item status codes surfaced in batch responses.
const STATUS_OK: i32 = 0;
const STATUS_COMMUNICATION: i32 = -70402;
const STATUS_READ_ONLY: i32 = -70404;
const STATUS_WRITE_ONLY: i32 = -70405;
const STATUS_NOTIFICATION_UNSUPPORTED: i32 = -70406;
const STATUS_NOT_FOUND: i32 = -70409;

pub struct Router {
    model: Arc<Model>,
    registry: Arc<dyn Registry>,
    subscriptions: Arc<SubscriptionManager>,
    pairing_changed: Option<PairingListener>,
}

#[derive(Deserialize)]
struct WriteBody {
    characteristics: Vec<WriteItem>,
}

#[derive(Deserialize)]
struct WriteItem {
    aid: u64,
    iid: u64,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    ev: Option<bool>,
}

impl Router {
    pub fn new(
        model: Arc<Model>,
        registry: Arc<dyn Registry>,
        subscriptions: Arc<SubscriptionManager>,
        pairing_changed: Option<PairingListener>,
    ) -> Self {
        Self {
            model,
            registry,
            subscriptions,
            pairing_changed,
        }
    }

    pub async fn route(&self, req: &Request, conn: ConnId) -> Response {
        match (req.method, req.path.as_str()) {
            (Method::Get, "/accessories") => self.accessories().await,
            (Method::Get, "/characteristics") => {
                self.read_characteristics(req.query.as_deref()).await
            }
            (Method::Put, "/characteristics") => {
                self.write_characteristics(&req.body, conn).await
            }
            (Method::Post, "/pairings") => self.pairings(&req.body),

            (method, path) => {
                warn!("unknown route: {method} {path}");
                Response::not_found()
            }
        }
    }

    /// GET /accessories: the full accessory/service/characteristic tree
    /// with current values for everything readable.
    async fn accessories(&self) -> Response {
        let mut accessories = Vec::new();

        for accessory in self.model.accessories() {
            let mut services = Vec::new();

            for service in accessory.services() {
                let reads = service.characteristics.iter().map(|c| {
                    let c = c.clone();
                    async move {
                        let perms = c.perms();

                        let value = if perms.read {
                            Some(c.read().await.ok().unwrap_or(Value::Null))
                        } else {
                            None
                        };

                        let mut out = json!({
                            "iid": c.iid(),
                            "type": c.type_id(),
                            "format": c.format(),
                            "perms": perms.as_strs(),
                        });

                        if let (Some(value), Some(map)) = (value, out.as_object_mut()) {
                            map.insert("value".into(), value);
                        }

                        out
                    }
                });

                services.push(json!({
                    "iid": service.iid,
                    "type": service.type_id,
                    "characteristics": join_all(reads).await,
                }));
            }

            accessories.push(json!({
                "aid": accessory.aid(),
                "services": services,
            }));
        }

        let body = json!({ "accessories": accessories });

        Response::ok_json(body.to_string().into_bytes())
    }

    /// GET /characteristics?id=aid.iid[,aid.iid...]
    async fn read_characteristics(&self, query: Option<&str>) -> Response {
        let Some(ids) = query.and_then(parse_id_query) else {
            return Response::bad_request();
        };

        let reads = ids.into_iter().map(|(aid, iid)| {
            let characteristic = self.model.characteristic(aid, iid);

            async move {
                let status = match characteristic {
                    None => Err(STATUS_NOT_FOUND),
                    Some(c) if !c.perms().read => Err(STATUS_WRITE_ONLY),
                    Some(c) => c.read().await.map_err(|e| {
                        error!("read {aid}.{iid}: {e}");
                        STATUS_COMMUNICATION
                    }),
                };

                match status {
                    Ok(value) => (json!({"aid": aid, "iid": iid, "value": value}), true),
                    Err(status) => (json!({"aid": aid, "iid": iid, "status": status}), false),
                }
            }
        });

        let results = join_all(reads).await;
        let all_ok = results.iter().all(|(_, ok)| *ok);
        let items: Vec<Value> = results.into_iter().map(|(item, _)| item).collect();

        let body = json!({ "characteristics": items }).to_string().into_bytes();

        if all_ok {
            Response::ok_json(body)
        } else {
            Response::multi_status_json(body)
        }
    }

    /// PUT /characteristics: batch value writes and event subscription
    /// changes; every item succeeds or fails independently.
    async fn write_characteristics(&self, body: &[u8], conn: ConnId) -> Response {
        let Ok(parsed) = serde_json::from_slice::<WriteBody>(body) else {
            return Response::bad_request();
        };

        let writes = parsed.characteristics.into_iter().map(|item| {
            let characteristic = self.model.characteristic(item.aid, item.iid);
            let subscriptions = self.subscriptions.clone();

            async move {
                let WriteItem {
                    aid,
                    iid,
                    value,
                    ev,
                } = item;

                let Some(c) = characteristic else {
                    return (aid, iid, STATUS_NOT_FOUND);
                };

                let mut status = STATUS_OK;

                if let Some(value) = value {
                    status = write_value(&c, value).await;
                }

                if let Some(subscribe) = ev {
                    if status == STATUS_OK {
                        status = toggle_events(&subscriptions, &c, (aid, iid), conn, subscribe);
                    }
                }

                (aid, iid, status)
            }
        });

        let results = join_all(writes).await;

        if results.iter().all(|(_, _, status)| *status == STATUS_OK) {
            // per protocol convention, full success needs no body
            return Response::no_content();
        }

        let items: Vec<Value> = results
            .into_iter()
            .map(|(aid, iid, status)| json!({"aid": aid, "iid": iid, "status": status}))
            .collect();

        let body = json!({ "characteristics": items });

        Response::multi_status_json(body.to_string().into_bytes())
    }

    /// POST /pairings: add (3), remove (4) and list (5) controller
    /// identities, binary record in and out.
    fn pairings(&self, body: &[u8]) -> Response {
        let tags = match Tags::try_from(bytes::Bytes::copy_from_slice(body)) {
            Ok(tags) => tags,
            Err(e) => {
                warn!("pairings: {e}");
                return Response::bad_request();
            }
        };

        if !matches!(tags.state(), Ok(1)) {
            return Response::ok_tlv8(pair::error_tags(2, pair::code::UNKNOWN));
        }

        let outcome = match tags.method() {
            Ok(method::ADD_PAIRING) => self.add_pairing(&tags),
            Ok(method::REMOVE_PAIRING) => self.remove_pairing(&tags),
            Ok(method::LIST_PAIRINGS) => return self.list_pairings(),
            other => {
                warn!("pairings: unrecognized method {other:?}");
                return Response::ok_tlv8(pair::error_tags(2, pair::code::UNKNOWN));
            }
        };

        match outcome {
            Ok(()) => Response::ok_tlv8(success_tags()),
            Err(response) => response,
        }
    }

    fn add_pairing(&self, tags: &Tags) -> Result<(), Response> {
        let (id, ltpk) = match (tags.bytes(Idx::Identifier), tags.public_key()) {
            (Ok(id), Ok(pk)) => (id, pk),
            _ => return Err(Response::bad_request()),
        };

        let Ok(public_key) = <[u8; 32]>::try_from(ltpk) else {
            return Err(Response::bad_request());
        };

        let permissions = match tags.get_cloned(Idx::Permissions) {
            Ok(Val::Permissions(p)) => p,
            _ => PERM_ADMIN,
        };

        self.registry
            .save_pairing(PairingIdentity {
                id: id.to_vec(),
                public_key,
                permissions,
            })
            .map_err(|e| {
                error!("add pairing: {e}");
                Response::internal_server_error()
            })?;

        self.on_pairing_changed();

        Ok(())
    }

    fn remove_pairing(&self, tags: &Tags) -> Result<(), Response> {
        let Ok(id) = tags.bytes(Idx::Identifier) else {
            return Err(Response::bad_request());
        };

        self.registry.remove_pairing(id).map_err(|e| {
            error!("remove pairing: {e}");
            Response::internal_server_error()
        })?;

        info!("removed pairing {}", String::from_utf8_lossy(id));
        self.on_pairing_changed();

        Ok(())
    }

    fn list_pairings(&self) -> Response {
        let mut tags = success_tags();

        let pairings = self.registry.pairings();
        let last = pairings.len().saturating_sub(1);

        for (n, pairing) in pairings.into_iter().enumerate() {
            tags.push(Val::Identifier(pairing.id));
            tags.push(Val::PublicKey(pairing.public_key.to_vec()));
            tags.push(Val::Permissions(pairing.permissions));

            if n != last {
                tags.push(Val::Separator);
            }
        }

        Response::ok_tlv8(tags)
    }

    pub(crate) fn on_pairing_changed(&self) {
        if let Some(listener) = self.pairing_changed.as_ref() {
            listener();
        }
    }
}

/// The fixed two-field success record answering pairing management.
fn success_tags() -> Tags {
    let mut tags = Tags::default();
    tags.push(Val::State(2));

    tags
}

async fn write_value(c: &Arc<dyn Characteristic>, value: Value) -> i32 {
    if !c.perms().write {
        return STATUS_READ_ONLY;
    }

    match c.write(value).await {
        Ok(()) => STATUS_OK,
        Err(e) => {
            error!("write {}: {e}", c.iid());
            STATUS_COMMUNICATION
        }
    }
}

fn toggle_events(
    subscriptions: &Arc<SubscriptionManager>,
    c: &Arc<dyn Characteristic>,
    char_id: CharId,
    conn: ConnId,
    subscribe: bool,
) -> i32 {
    if !c.perms().events {
        return STATUS_NOTIFICATION_UNSUPPORTED;
    }

    if subscribe {
        subscriptions.subscribe(char_id, conn, c);
    } else {
        subscriptions.unsubscribe(char_id, conn);
    }

    STATUS_OK
}

fn parse_id_query(query: &str) -> Option<Vec<(u64, u64)>> {
    let ids = query
        .split('&')
        .find_map(|param| param.strip_prefix("id="))?;

    let mut out = Vec::new();

    for id in ids.split(',') {
        let (aid, iid) = id.split_once('.')?;
        out.push((aid.parse().ok()?, iid.parse().ok()?));
    }

    (!out.is_empty()).then_some(out)
}

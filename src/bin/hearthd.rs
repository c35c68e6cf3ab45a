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

//! Standalone accessory daemon: a single demo switch behind the full
//! pairing, verification and session stack.

use anyhow::anyhow;
use hearth::{
    advert::Advert,
    model::{Accessory, ChangeSink, Characteristic, Model, Perms, Service, Value},
    registry::{self, PairingListener, Registry},
    server::{self, Hub},
    Config, HostInfo, Result,
};
use futures::future::BoxFuture;
use mdns_sd::{self as Mdns, DaemonEvent};
use serde_json::json;
use std::{
    env,
    sync::{Arc, Mutex},
};
use tokio::{net::TcpListener, signal, sync::oneshot};
use tokio_util::sync::CancellationToken;

/// One on/off characteristic backed by process state; stands in for real
/// device I/O.
struct OnOff {
    state: Mutex<bool>,
    sink: Mutex<Option<ChangeSink>>,
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

    fn read(&self) -> BoxFuture<'_, std::result::Result<Value, hearth::Error>> {
        Box::pin(async move { Ok(json!(*self.state.lock().unwrap())) })
    }

    fn write(&self, value: Value) -> BoxFuture<'_, std::result::Result<(), hearth::Error>> {
        Box::pin(async move {
            let on = value
                .as_bool()
                .ok_or_else(|| hearth::Error::AccessoryOperation("expected bool".into()))?;

            *self.state.lock().unwrap() = on;
            tracing::info!("switch now {}", if on { "ON" } else { "OFF" });

            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink(1, self.iid(), json!(on));
            }

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

struct DemoSwitch {
    on: Arc<OnOff>,
}

impl DemoSwitch {
    fn build() -> Self {
        Self {
            on: Arc::new(OnOff {
                state: Mutex::new(false),
                sink: Mutex::new(None),
            }),
        }
    }
}

impl Accessory for DemoSwitch {
    fn aid(&self) -> u64 {
        1
    }

    fn label(&self) -> &str {
        "Hearth Switch"
    }

    fn services(&self) -> Vec<Service> {
        vec![Service {
            iid: 8,
            type_id: "49".into(),
            characteristics: vec![self.on.clone()],
        }]
    }
}

///
///
/// # Errors
///
/// Returns errors for any failure related to establishing the base app
/// runtime information (e.g. hostname) or setup of the networking socket.
#[tokio::main(worker_threads = 4)]
pub async fn main() -> Result<()> {
    setup_logging()?;
    let cancel_token = CancellationToken::new();
    let main_cancel_token = cancel_token.clone();
    let server_cancel_token = cancel_token.clone();

    let config = Config::default();

    let bind_addr = env::args()
        .nth(1)
        .unwrap_or_else(|| HostInfo::bind_address(config.port));

    tracing::info!("starting up, binding to {}", bind_addr);
    let listener = TcpListener::bind(&bind_addr).await?;

    let registry = registry::Memory::new(HostInfo::mac_as_str());

    let mut model = Model::new();
    model.add(Arc::new(DemoSwitch::build()));

    let mdns = Mdns::ServiceDaemon::new()?;
    let advert = Arc::new(Advert::build(&config, registry.as_ref()));
    advert.register(&mdns)?;

    // re-publish the discoverable flag whenever pairings change
    let pairing_listener: PairingListener = {
        let advert = advert.clone();
        let mdns = mdns.clone();
        let registry = registry.clone();

        Arc::new(move || {
            if let Err(e) = advert.set_discoverable(&mdns, !registry.is_paired()) {
                tracing::warn!("advert re-publish failed: {e}");
            }
        })
    };

    let hub = Hub::with_pairing_listener(config, registry, model, pairing_listener);

    let (main_tx, mut main_rx) = oneshot::channel();

    let main_handle = tokio::spawn(async move {
        let ctrl_c = { signal::ctrl_c() };
        tokio::pin!(ctrl_c);

        let monitor = mdns.monitor().expect("MDNS monitor creation failed");

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::warn!("caught ctrl-c, issuing cancel");
                    break;
                },
                mdns_event = monitor.recv_async() => mdns_report(mdns_event),
                _ = main_cancel_token.cancelled() => {
                    tracing::warn!("main task cancelled");
                    break;
                }
            }
        }

        if let Err(e) = advert.unregister(&mdns) {
            tracing::warn!("MDNS unregister failed: {e}");
        }

        mdns.shutdown().expect("MDNS shutdown failed");
        main_tx.send("main".to_string()).unwrap();
    });

    let (server_tx, mut server_rx) = oneshot::channel();

    let server_handle = tokio::spawn(async move {
        match server::run(listener, hub, server_cancel_token).await {
            Ok(()) => tracing::info!("server has shutdown gracefully"),
            Err(e) => tracing::error!("server error: {e}"),
        }

        server_tx.send("server".to_string()).unwrap();
    });

    let mut main_end = None;
    let mut server_end = None;

    while main_end.is_none() && server_end.is_none() {
        tokio::select! {
            v1 = (&mut main_rx), if main_end.is_none() => main_end = Some(v1.unwrap()),
            v2 = (&mut server_rx), if server_end.is_none() => server_end = Some(v2.unwrap()),
        }

        cancel_token.cancel();
    }

    let _res = tokio::join!(main_handle, server_handle);

    let res = (
        main_end.unwrap_or_else(|| "main none".to_string()),
        server_end.unwrap_or_else(|| "server none".to_string()),
    );

    tracing::info!("{res:?} exiting");

    Ok(())
}

fn mdns_report<E: std::fmt::Debug>(event: anyhow::Result<DaemonEvent, E>) {
    use DaemonEvent::Announce;

    match event {
        Ok(Announce(service, _ip)) => tracing::info!("{service} announced"),
        Ok(event) => tracing::warn!("{event:?}"),
        Err(e) => tracing::error!("mdns error: {e:#?}"),
    }
}

#[inline]
fn setup_logging() -> Result<()> {
    tracing_subscriber::fmt()
        // Use a more compact, abbreviated log format
        .compact()
        // Display source code file paths
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Don't display the event's target (module path)
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow!(e))
}

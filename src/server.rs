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

//! Accessory server.
//!
//! Provides an async `run` function that listens for inbound controller
//! connections, spawning a task per connection. Each task exclusively
//! owns its handshake and session state; the pairing registry and the
//! subscription manager are the only shared handles.

use crate::{
    conn,
    events::SubscriptionManager,
    http::{codec, Response},
    model::Model,
    registry::{PairingListener, Registry},
    router::Router,
    Config, Result, Shutdown,
};
use futures::SinkExt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{Decoder, Framed},
    sync::CancellationToken,
};

#[allow(unused)]
use tracing::{debug, error, info, warn};

/// Everything one accessory server shares across connections.
pub struct Hub {
    pub config: Arc<Config>,
    pub registry: Arc<dyn Registry>,
    pub model: Arc<Model>,
    pub subscriptions: Arc<SubscriptionManager>,
    pairing_changed: Option<PairingListener>,
}

impl Hub {
    #[must_use]
    pub fn new(config: Config, registry: Arc<dyn Registry>, model: Model) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            registry,
            model: Arc::new(model),
            subscriptions: SubscriptionManager::new(),
            pairing_changed: None,
        })
    }

    /// Same as [`Hub::new`] with a listener invoked whenever the set of
    /// paired controllers changes (advertisement re-publish).
    #[must_use]
    pub fn with_pairing_listener(
        config: Config,
        registry: Arc<dyn Registry>,
        model: Model,
        listener: PairingListener,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            registry,
            model: Arc::new(model),
            subscriptions: SubscriptionManager::new(),
            pairing_changed: Some(listener),
        })
    }

    fn router(&self) -> Router {
        Router::new(
            self.model.clone(),
            self.registry.clone(),
            self.subscriptions.clone(),
            self.pairing_changed.clone(),
        )
    }
}

/// Server listener state. Created in the `run` call. It includes a `run`
/// method which performs the TCP listening and initialization of
/// per-connection state.
struct Listener {
    listener: TcpListener,

    hub: Arc<Hub>,

    /// Limit the max number of connections.
    ///
    /// Before accepting a new connection, a permit is acquired. When
    /// handlers complete, the permit is returned to the semaphore.
    limit_connections: Arc<Semaphore>,

    /// Broadcasts a shutdown signal to all active connections.
    notify_shutdown: broadcast::Sender<()>,

    /// Used as part of the graceful shutdown process to wait for client
    /// connections to complete processing.
    shutdown_complete_tx: mpsc::Sender<()>,

    next_conn_id: AtomicU64,
}

/// Per-connection handler. Reads requests from the framed socket, runs
/// them through the connection state machine, and interleaves event
/// pushes for this connection's subscriptions.
struct Handler {
    framed: Framed<TcpStream, codec::Hap>,

    ctx: conn::Context,

    /// Event bodies queued by the subscription manager for this
    /// connection.
    events: mpsc::UnboundedReceiver<bytes::Bytes>,

    hub: Arc<Hub>,

    conn_id: u64,

    shutdown: Shutdown,

    _shutdown_complete: mpsc::Sender<()>,
}

impl Handler {
    /// Process a single connection until the peer disconnects, a fatal
    /// protocol error occurs, or shutdown is signalled.
    async fn run(mut self) -> Result<()> {
        let res = self.serve().await;

        // exactly-once release of subscriptions and session state, no
        // matter which path ended the connection
        self.hub.subscriptions.remove_connection(self.conn_id);

        res
    }

    async fn serve(&mut self) -> Result<()> {
        while !self.shutdown.is_shutdown() {
            tokio::select! {
                maybe_req = self.framed.next() => {
                    match maybe_req {
                        Some(Ok(req)) => {
                            debug!("{req}");

                            let response = self.ctx.respond_to(req).await?;
                            self.framed.send(response).await?;

                            // session keys from a just-finished verify are
                            // installed after the M4 response left in clear
                            if let Some(cipher) = self.ctx.take_pending_cipher() {
                                info!("connection {}: session encryption on", self.conn_id);
                                self.framed.codec_mut().install_cipher(cipher);
                            }
                        }

                        Some(Err(e)) => {
                            // includes session decrypt failures, which are
                            // fatal by design
                            return Err(e);
                        }

                        None => break, // peer closed
                    }
                }

                maybe_event = self.events.recv(), if self.ctx.is_verified() => {
                    if let Some(body) = maybe_event {
                        self.framed.send(Response::event_json(body)).await?;
                    }
                }

                _ = self.shutdown.recv() => (),
            }
        }

        Ok(())
    }
}

/// Maximum number of concurrent controller connections.
const MAX_CONNECTIONS: usize = 8;

/// Run the server.
///
/// Accepts connections from the supplied listener. For each inbound
/// connection, a task is spawned to handle it. The server runs until the
/// cancel token fires, at which point it shuts down gracefully.
///
/// # Errors
///
/// Returns an error for listener related errors
pub async fn run(listener: TcpListener, hub: Arc<Hub>, cancel_token: CancellationToken) -> Result<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let mut server = Listener {
        listener,
        hub,
        limit_connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        notify_shutdown: notify_shutdown.clone(),
        shutdown_complete_tx: shutdown_complete_tx.clone(),
        next_conn_id: AtomicU64::new(1),
    };

    tokio::select! {
        res = server.run() => {
            // Errors encountered when handling individual connections do
            // not bubble up to this point.
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }

        _ = cancel_token.cancelled() => {
            info!("cancel requested");
        }
    }

    // When `notify_shutdown` is dropped, all tasks which have subscribed
    // will receive the shutdown signal and can exit.
    drop(server);
    drop(notify_shutdown);
    drop(shutdown_complete_tx);

    // Wait for all active connections to finish processing.
    let _ = shutdown_complete_rx.recv().await;

    info!("shutdown complete");

    Ok(())
}

impl Listener {
    /// Listen for inbound connections, spawning a task per connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if accepting returns an error repeatedly; transient
    /// failures are retried with exponential back off.
    async fn run(&mut self) -> Result<()> {
        info!("accepting inbound connections");

        loop {
            // `acquire_owned()` returns `Err` only when the semaphore has
            // been closed, which we never do.
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let socket = self.accept().await?;

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let hub = self.hub.clone();

            let handler = Handler {
                framed: codec::Hap::default().framed(socket),
                ctx: conn::Context::new(
                    conn_id,
                    hub.config.clone(),
                    hub.registry.clone(),
                    hub.router(),
                ),
                events: hub.subscriptions.register(conn_id),
                hub,
                conn_id,
                shutdown: Shutdown::new(&self.notify_shutdown),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = Handler::run(handler).await {
                    warn!(cause = ?err, "connection closed");
                }

                drop(permit);
            });
        }
    }

    /// Accept an inbound connection, backing off exponentially on
    /// transient failures.
    async fn accept(&mut self) -> Result<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, remote_addr)) => {
                    info!("ACCEPTED {remote_addr}");
                    return Ok(socket);
                }
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;

            backoff *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Hub;
    use crate::{model::Model, registry::Memory, Config};
    use tokio::net::TcpListener;
    use tokio::task;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    #[traced_test]
    #[tokio::test]
    async fn can_run_and_cancel_server() {
        let hub = Hub::new(Config::default(), Memory::new("AA:BB:CC:DD:EE:FF"), Model::new());

        let cancel_token = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let jh = task::spawn(super::run(listener, hub, cancel_token.clone()));

        cancel_token.cancel();

        match jh.await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => panic!("server error: {e}"),
            Err(e) => panic!("join error: {e}"),
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn serves_a_clear_text_handshake_request() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let hub = Hub::new(Config::default(), Memory::new("AA:BB:CC:DD:EE:FF"), Model::new());

        let cancel_token = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let jh = task::spawn(super::run(listener, hub, cancel_token.clone()));

        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();

        // unauthorized route while unverified
        socket
            .write_all(b"GET /accessories HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]);

        assert!(head.starts_with("HTTP/1.1 470"), "got: {head}");

        drop(socket);
        cancel_token.cancel();
        let _ = jh.await;
    }
}

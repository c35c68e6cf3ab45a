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

//! Per-connection state machine.
//!
//! Owns the in-flight handshakes and the gate in front of the router:
//! only `/pair-setup` and `/pair-verify` are reachable before the
//! connection is verified, unless the embedding configuration explicitly
//! allows unauthenticated access. All state here is exclusively owned by
//! one connection task; no locking anywhere.

use crate::{
    cipher,
    events::ConnId,
    http::{Method, Request, Response},
    pair::{self, code, setup, verify},
    registry::Registry,
    router::Router,
    Config, Error, Result, Tags,
};
use anyhow::anyhow;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

/// Failed verify attempts tolerated before the connection is dropped.
const VERIFY_ATTEMPTS_MAX: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unverified,
    Verified,
}

pub struct Context {
    id: ConnId,
    state: State,
    config: Arc<Config>,
    registry: Arc<dyn Registry>,
    router: Router,
    setup: Option<setup::Context>,
    verify: Option<verify::Context>,
    verify_attempts: u8,
    pending_cipher: Option<cipher::Context>,
}

impl Context {
    pub fn new(
        id: ConnId,
        config: Arc<Config>,
        registry: Arc<dyn Registry>,
        router: Router,
    ) -> Self {
        Self {
            id,
            state: State::Unverified,
            config,
            registry,
            router,
            setup: None,
            verify: None,
            verify_attempts: 0,
            pending_cipher: None,
        }
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.state == State::Verified
    }

    /// Session keys produced by a just-completed verify. The caller
    /// installs them into the codec only after the M4 response has gone
    /// out in the clear.
    pub fn take_pending_cipher(&mut self) -> Option<cipher::Context> {
        self.pending_cipher.take()
    }

    /// Handle one request. `Err` means the connection must be closed;
    /// everything recoverable comes back as a `Response`.
    pub async fn respond_to(&mut self, req: Request) -> Result<Response> {
        match (req.method, req.path.as_str()) {
            (Method::Post, "/pair-setup") => self.pair_setup(&req.body),
            (Method::Post, "/pair-verify") => self.pair_verify(&req.body),

            _ if self.state == State::Verified || self.config.unauthenticated_allowed => {
                Ok(self.router.route(&req, self.id).await)
            }

            (method, path) => {
                warn!("unauthorized: {method} {path}");
                Ok(Response::unauthorized())
            }
        }
    }

    fn pair_setup(&mut self, body: &Bytes) -> Result<Response> {
        let Ok(tags) = Tags::try_from(body.clone()) else {
            // malformed input aborts the active handshake, nothing else
            self.setup = None;
            return Ok(Response::bad_request());
        };

        let Ok(state) = tags.state() else {
            self.setup = None;
            return Ok(Response::bad_request());
        };

        match state {
            1 => {
                // a fresh M1 always starts over with new ephemerals
                let mut setup = setup::Context::build(self.config.pin.clone());

                match setup.m1_m2() {
                    Ok(t_out) => {
                        self.setup = Some(setup);
                        Ok(Response::ok_tlv8(t_out))
                    }
                    Err(e) => Ok(stage_failure(2, &e)),
                }
            }

            3 => match self.setup.as_mut() {
                Some(setup) => match setup.m3_m4(&tags) {
                    Ok(t_out) => Ok(Response::ok_tlv8(t_out)),
                    Err(e) => {
                        warn!("setup M3: {e}");
                        self.setup = None;
                        Ok(stage_failure(4, &e))
                    }
                },
                None => Ok(Response::ok_tlv8(pair::error_tags(4, code::AUTHENTICATION))),
            },

            5 => match self.setup.as_mut() {
                Some(setup) => match setup.m5_m6(&tags, self.registry.as_ref()) {
                    Ok(t_out) => {
                        self.setup = None;
                        self.router.on_pairing_changed();
                        Ok(Response::ok_tlv8(t_out))
                    }
                    Err(e) => {
                        warn!("setup M5: {e}");
                        self.setup = None;
                        Ok(stage_failure(6, &e))
                    }
                },
                None => Ok(Response::ok_tlv8(pair::error_tags(6, code::AUTHENTICATION))),
            },

            state => {
                warn!("setup: unexpected state {state}");
                self.setup = None;
                Ok(Response::ok_tlv8(pair::error_tags(
                    state.wrapping_add(1),
                    code::UNKNOWN,
                )))
            }
        }
    }

    fn pair_verify(&mut self, body: &Bytes) -> Result<Response> {
        let Ok(tags) = Tags::try_from(body.clone()) else {
            self.verify = None;
            return self.verify_failed(Response::bad_request());
        };

        let Ok(state) = tags.state() else {
            self.verify = None;
            return self.verify_failed(Response::bad_request());
        };

        match state {
            1 => {
                let mut verify = verify::Context::build();

                match verify.m1_m2(&tags, self.registry.as_ref()) {
                    Ok(t_out) => {
                        self.verify = Some(verify);
                        Ok(Response::ok_tlv8(t_out))
                    }
                    Err(e) => {
                        warn!("verify M1: {e}");
                        self.verify_failed(stage_failure(2, &e))
                    }
                }
            }

            3 => match self.verify.take() {
                Some(mut verify) => match verify.m3_m4(&tags, self.registry.as_ref()) {
                    Ok((t_out, session_cipher)) => {
                        info!("connection {} verified", self.id);

                        self.pending_cipher = Some(session_cipher);
                        self.state = State::Verified;
                        self.verify_attempts = 0;

                        Ok(Response::ok_tlv8(t_out))
                    }
                    Err(e) => {
                        warn!("verify M3: {e}");
                        self.verify_failed(stage_failure(4, &e))
                    }
                },
                None => self.verify_failed(Response::ok_tlv8(pair::error_tags(
                    4,
                    code::AUTHENTICATION,
                ))),
            },

            state => {
                warn!("verify: unexpected state {state}");
                self.verify = None;
                self.verify_failed(Response::ok_tlv8(pair::error_tags(
                    state.wrapping_add(1),
                    code::UNKNOWN,
                )))
            }
        }
    }

    /// Count a failed verify attempt; past the bound the connection is
    /// dropped instead of answered.
    fn verify_failed(&mut self, response: Response) -> Result<Response> {
        self.verify_attempts += 1;

        if self.verify_attempts >= VERIFY_ATTEMPTS_MAX {
            return Err(anyhow!(
                "connection {}: verify failed {} times",
                self.id,
                self.verify_attempts
            ));
        }

        Ok(response)
    }
}

/// Map a handshake error onto the wire: auth failures answer in-record
/// with the successor state, malformed input is a client error, anything
/// else (registry I/O, key material) is on us.
fn stage_failure(state: u8, e: &Error) -> Response {
    match e {
        Error::AuthenticationFailure(_) => {
            Response::ok_tlv8(pair::error_tags(state, code::AUTHENTICATION))
        }
        Error::MalformedRecord(_) => Response::bad_request(),
        _ => Response::internal_server_error(),
    }
}

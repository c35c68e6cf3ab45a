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

pub mod advert;

pub(crate) mod cipher;
pub use cipher::Context as CipherCtx;

pub(crate) mod conn;

pub mod error;
pub use error::Error;

pub mod events;
pub use events::SubscriptionManager;

pub(crate) mod host;
pub use host::Info as HostInfo;

pub mod http;

pub mod model;

pub mod pair;

pub mod registry;
pub use registry::{PairingIdentity, Registry};

pub(crate) mod router;

pub mod server; // HAP accessory server

pub(crate) mod shutdown;
use shutdown::Shutdown;

pub mod tags;
pub use tags::Map as Tags;

// This is defined as a convenience.
pub type Result<T> = anyhow::Result<T>;

/// Embedding configuration for one accessory server.
///
/// Injected at startup; nothing in the core reads process-global
/// configuration state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Accessory label shown during discovery and pairing.
    pub name: String,
    /// Setup PIN in the `XXX-XX-XXX` form the controller prompts for.
    pub pin: String,
    pub port: u16,
    /// Honored uniformly for diagnostic/bridge use: when set, routes that
    /// normally require a verified connection are reachable in the clear.
    pub unauthenticated_allowed: bool,
    /// Monotonically increasing configuration revision (`c#` in the
    /// discovery record). Bump whenever the accessory tree changes.
    pub configuration_index: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Hearth".into(),
            pin: "031-45-154".into(),
            port: 5001,
            unauthenticated_allowed: false,
            configuration_index: 1,
        }
    }
}

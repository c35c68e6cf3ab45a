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

use thiserror::Error;

/// Protocol error taxonomy.
///
/// None of these are process-fatal. `AuthenticationFailure` aborts the
/// handshake that raised it; the one connection-fatal case is a session
/// cipher decrypt failure, which the connection handler treats as
/// unrecoverable because the receive nonce cannot be rewound.
#[derive(Debug, Error)]
pub enum Error {
    /// Truncated or otherwise invalid binary record input.
    #[error("malformed record: {0}")]
    MalformedRecord(&'static str),

    /// Bad password proof, bad signature, unknown pairing identifier or a
    /// failed authenticated decryption.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(&'static str),

    /// Unmapped path.
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    /// Authenticated-only route hit while unverified.
    #[error("unauthorized route: {0}")]
    UnauthorizedRoute(String),

    /// Underlying device call failed; surfaced per-item in batch
    /// responses, never fatal to the connection.
    #[error("accessory operation failed: {0}")]
    AccessoryOperation(String),
}

impl Error {
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailure(_))
    }
}

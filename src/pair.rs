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

//! Pair-Setup and Pair-Verify handshakes.
//!
//! Each in-flight handshake is owned exclusively by the connection that
//! started it. A failure at any stage destroys the handshake state; a
//! fresh attempt starts over at stage 1 with new ephemerals.

use crate::{Error, Tags};
use bytes::BytesMut;
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};

pub mod setup;
pub mod srp;
pub mod verify;

/// Pairing method codes carried in the Method tag.
pub mod method {
    pub const PAIR_SETUP: u8 = 0;
    pub const PAIR_SETUP_WITH_AUTH: u8 = 1;
    pub const ADD_PAIRING: u8 = 3;
    pub const REMOVE_PAIRING: u8 = 4;
    pub const LIST_PAIRINGS: u8 = 5;
}

/// Error tag codes for in-handshake failures.
pub mod code {
    pub const UNKNOWN: u8 = 0x01;
    pub const AUTHENTICATION: u8 = 0x02;
    pub const BACKOFF: u8 = 0x03;
    pub const MAX_PEERS: u8 = 0x04;
    pub const MAX_TRIES: u8 = 0x05;
    pub const UNAVAILABLE: u8 = 0x06;
    pub const BUSY: u8 = 0x07;
}

/// Build the record answering a failed stage: the successor state plus an
/// error code. Sent with HTTP 200; the record carries the failure.
#[must_use]
pub fn error_tags(state: u8, code: u8) -> Tags {
    use crate::tags::Val;

    let mut tags = Tags::default();
    tags.push(Val::State(state));
    tags.push(Val::Error(code));

    tags
}

const AUTH_TAG_LEN: usize = 16;

/// Encrypt a handshake envelope (identity sub-record) under a derived key
/// and a fixed per-message nonce, appending the auth tag.
pub(crate) fn seal(key: &[u8; 32], nonce: &[u8; 12], mut data: BytesMut) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), &[], &mut data)
        .map_err(|_| Error::AuthenticationFailure("envelope seal failed"))?;

    data.extend_from_slice(&tag);

    Ok(data.to_vec())
}

/// Authenticate and decrypt a handshake envelope.
pub(crate) fn open(key: &[u8; 32], nonce: &[u8; 12], data: &[u8]) -> Result<BytesMut, Error> {
    if data.len() < AUTH_TAG_LEN {
        return Err(Error::MalformedRecord("encrypted data too short"));
    }

    let (ct, tag) = data.split_at(data.len() - AUTH_TAG_LEN);
    let mut buf = BytesMut::from(ct);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), &[], &mut buf, Tag::from_slice(tag))
        .map_err(|_| Error::AuthenticationFailure("envelope decrypt failed"))?;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::{open, seal};
    use crate::Error;
    use bytes::BytesMut;

    #[test]
    fn envelope_roundtrip_and_tamper() {
        let key = [0x11u8; 32];
        let nonce = b"\0\0\0\0PV-Msg02";

        let sealed = seal(&key, nonce, BytesMut::from(b"identity".as_slice())).unwrap();
        let clear = open(&key, nonce, &sealed).unwrap();
        assert_eq!(&clear[..], b"identity");

        let mut tampered = sealed;
        tampered[0] ^= 0x80;
        assert!(matches!(
            open(&key, nonce, &tampered),
            Err(Error::AuthenticationFailure(_))
        ));
    }
}

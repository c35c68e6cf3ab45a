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

//! Session crypto layer for one verified connection.
//!
//! Each direction has its own key and a monotonically increasing 64 bit
//! nonce counter, reset to zero when the session keys are installed and
//! never reused for their lifetime. Frames are `u16` length prefix (also
//! the associated data) + ciphertext + 16 byte auth tag.

use crate::Error;
use bytes::{Buf, BytesMut};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use std::{
    fmt,
    mem::size_of,
    ops::Deref,
    sync::{Arc, RwLock},
};

pub type Lock = Option<Arc<RwLock<Context>>>;

/// Largest plaintext carried by a single frame. Larger payloads are split
/// before encryption and reassembled after decryption.
pub const PLAINTEXT_LEN_MAX: usize = 0x400;

const AUTH_TAG_LEN: usize = 16;

const SALT: &[u8] = b"Control-Salt";
const WRITE_INFO: &[u8] = b"Control-Write-Encryption-Key";
const READ_INFO: &[u8] = b"Control-Read-Encryption-Key";

/// HKDF-SHA512, 32 byte output. Shared by the handshakes and the session
/// key schedule.
pub(crate) fn derive_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; 32] {
    use hmac_sha512::HKDF;

    let prk = HKDF::extract(salt, ikm);

    let mut key = [0u8; 32];
    HKDF::expand(&mut key, prk, info);

    key
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockLen(pub u16);

impl BlockLen {
    pub fn from(mut buf: BytesMut) -> Self {
        Self(buf.get_u16_le())
    }

    pub fn have_min_bytes(len: usize) -> bool {
        len >= size_of::<u16>() + AUTH_TAG_LEN + 1
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn need_more(self, buf_len: usize) -> bool {
        buf_len < self.len_with_auth_tag()
    }

    pub fn len_with_auth_tag(self) -> usize {
        AUTH_TAG_LEN + self.0 as usize
    }
}

impl Deref for BlockLen {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for BlockLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Context {
    encrypt_key: Key,
    decrypt_key: Key,
    decrypt_nonce: u64,
    encrypt_nonce: u64,
}

impl Context {
    /// Derive the per-direction session keys from the verify shared secret.
    ///
    /// The controller encrypts with the write key and the accessory with
    /// the read key, so our encrypt side takes `READ_INFO`.
    #[must_use]
    pub fn new(shared_secret: &[u8]) -> Self {
        let encrypt_key = derive_key(SALT, shared_secret, READ_INFO);
        let decrypt_key = derive_key(SALT, shared_secret, WRITE_INFO);

        Self {
            encrypt_key: *Key::from_slice(&encrypt_key),
            decrypt_key: *Key::from_slice(&decrypt_key),
            decrypt_nonce: 0,
            encrypt_nonce: 0,
        }
    }

    /// Decrypt one frame. `buf` holds ciphertext + auth tag; `block_len`
    /// is the plaintext length from the frame's length prefix.
    ///
    /// The receive counter advances regardless of outcome; a failure here
    /// is fatal to the connection since the counter cannot be rewound.
    pub fn decrypt(&mut self, mut buf: BytesMut, block_len: u16) -> Result<BytesMut, Error> {
        if buf.len() != block_len as usize + AUTH_TAG_LEN {
            return Err(Error::AuthenticationFailure("frame length mismatch"));
        }

        let auth_tag_bytes = buf.split_off(block_len as usize);
        let auth_tag = Tag::from_slice(&auth_tag_bytes);

        // the associated data is the plaintext length exactly as it
        // appeared on the wire
        let associated_data = block_len.to_le_bytes();

        let nonce = Self::nonce_for(self.decrypt_nonce);
        self.decrypt_nonce += 1;

        let chacha = ChaCha20Poly1305::new(&self.decrypt_key);
        chacha
            .decrypt_in_place_detached(&nonce, &associated_data, &mut buf, auth_tag)
            .map_err(|_| Error::AuthenticationFailure("frame decrypt failed"))?;

        Ok(buf)
    }

    /// Encrypt an outbound payload, splitting it into as many frames as
    /// the plaintext bound requires. Returns the wire bytes (length
    /// prefix + ciphertext + tag per frame).
    pub fn encrypt(&mut self, buf: BytesMut) -> Result<BytesMut, Error> {
        let mut out = BytesMut::with_capacity(
            buf.len() + (buf.len() / PLAINTEXT_LEN_MAX + 1) * (size_of::<u16>() + AUTH_TAG_LEN),
        );

        let cipher = ChaCha20Poly1305::new(&self.encrypt_key);

        for chunk in buf.chunks(PLAINTEXT_LEN_MAX) {
            let msg_len = chunk.len() as u16; // bounded by PLAINTEXT_LEN_MAX
            let associated_data = msg_len.to_le_bytes();

            let mut message = BytesMut::from(chunk);

            let nonce = Self::nonce_for(self.encrypt_nonce);

            let tag = cipher
                .encrypt_in_place_detached(&nonce, &associated_data, &mut message)
                .map_err(|_| Error::AuthenticationFailure("frame encrypt failed"))?;

            out.extend_from_slice(&associated_data);
            out.extend_from_slice(&message);
            out.extend_from_slice(&tag);

            self.encrypt_nonce += 1;
        }

        Ok(out)
    }

    /// The u64 frame counter occupies the final eight bytes of the 96 bit
    /// nonce, little endian; the leading four bytes stay zero.
    fn nonce_for(count: u64) -> Nonce {
        let mut nonce = Nonce::default();
        nonce[4..].copy_from_slice(&count.to_le_bytes());

        nonce
    }

    #[must_use]
    pub fn frames_in(&self) -> u64 {
        self.decrypt_nonce
    }

    #[must_use]
    pub fn frames_out(&self) -> u64 {
        self.encrypt_nonce
    }
}

#[cfg(test)]
impl Context {
    /// Controller-keyed twin: encrypts with the accessory's decrypt key
    /// and vice versa. Test suites use it to speak both directions.
    pub(crate) fn controller(shared_secret: &[u8]) -> Self {
        let mut ctx = Self::new(shared_secret);
        std::mem::swap(&mut ctx.encrypt_key, &mut ctx.decrypt_key);

        ctx
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CIPHER CONTEXT in={} out={}",
            self.decrypt_nonce, self.encrypt_nonce
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockLen, Context, PLAINTEXT_LEN_MAX};
    use crate::Error;
    use bytes::{Buf, BytesMut};

    // a matched pair: what one side encrypts the other decrypts
    fn pair() -> (Context, Context) {
        let secret = [0x5au8; 32];

        (Context::new(&secret), Context::controller(&secret))
    }

    fn decrypt_all(ctx: &mut Context, mut wire: BytesMut) -> Result<BytesMut, Error> {
        let mut clear = BytesMut::new();

        while !wire.is_empty() {
            let block_len = wire.get_u16_le();
            let frame = wire.split_to(block_len as usize + 16);
            clear.extend_from_slice(&ctx.decrypt(frame, block_len)?);
        }

        Ok(clear)
    }

    #[test]
    fn can_roundtrip_within_bound() {
        let (mut accessory, mut controller) = pair();

        let plaintext = b"HTTP/1.1 200 OK\r\n\r\n".as_slice();
        let wire = accessory.encrypt(BytesMut::from(plaintext)).unwrap();

        let clear = decrypt_all(&mut controller, wire).unwrap();

        assert_eq!(&clear[..], plaintext);
        assert_eq!(accessory.frames_out(), 1);
        assert_eq!(controller.frames_in(), 1);
    }

    #[test]
    fn oversize_payload_splits_into_frames() {
        let (mut accessory, mut controller) = pair();

        let plaintext = vec![0xabu8; PLAINTEXT_LEN_MAX * 2 + 100];
        let wire = accessory.encrypt(BytesMut::from(&plaintext[..])).unwrap();

        assert_eq!(accessory.frames_out(), 3);

        let clear = decrypt_all(&mut controller, wire).unwrap();
        assert_eq!(&clear[..], &plaintext[..]);
        assert_eq!(controller.frames_in(), 3);
    }

    #[test]
    fn tampered_frame_fails_authentication() {
        let (mut accessory, mut controller) = pair();

        let mut wire = accessory.encrypt(BytesMut::from(b"hands off".as_slice())).unwrap();

        // flip one ciphertext bit
        let n = wire.len() / 2;
        wire[n] ^= 0x01;

        let res = decrypt_all(&mut controller, wire);
        assert!(matches!(res, Err(Error::AuthenticationFailure(_))));

        // the receive counter advanced even though the frame failed
        assert_eq!(controller.frames_in(), 1);
    }

    #[test]
    fn nonce_counters_are_per_direction() {
        let (mut accessory, _) = pair();

        for _ in 0..5 {
            accessory.encrypt(BytesMut::from(b"tick".as_slice())).unwrap();
        }

        assert_eq!(accessory.frames_out(), 5);
        assert_eq!(accessory.frames_in(), 0);
    }

    #[test]
    fn block_len_accounting() {
        assert!(BlockLen::have_min_bytes(19));
        assert!(!BlockLen::have_min_bytes(18));

        let bl = BlockLen(8);
        assert_eq!(bl.len_with_auth_tag(), 24);
        assert!(bl.need_more(23));
        assert!(!bl.need_more(24));
        assert!(!bl.is_empty());
    }
}

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

//! Self-describing binary record codec (type, length, value triples).
//!
//! Every pairing and verification message travels as one of these records.
//! Values longer than a single 255 byte chunk repeat the tag; decoding
//! merges same-tag runs back together in arrival order.

use crate::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use pretty_hex::PrettyHex;
use std::fmt::{self, Write};
use tracing::debug;
use Val::{
    EncryptedData, Error as ErrorTag, Flags, FragmentData, FragmentLast, Identifier, Method,
    Permissions, Proof, PublicKey, RetryDelay, Salt, Separator, Signature, State,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Idx {
    Method = 0,        // (integer) Method to use for pairing. See PairMethod
    Identifier = 1,    // (UTF-8) Identifier for authentication
    Salt = 2,          // (bytes) 16+ bytes of random salt
    PublicKey = 3,     // (bytes) Curve25519, SRP public key or signed Ed25519 key
    Proof = 4,         // (bytes) Ed25519 or SRP proof
    EncryptedData = 5, // (bytes) Encrypted data with auth tag at end
    State = 6,         // (integer) State of the pairing process. 1=M1, 2=M2, etc.
    Error = 7,         // (integer) Error code, only present when error
    RetryDelay = 8,    // (integer) Seconds to delay until retrying a setup code
    Signature = 10,    // (bytes) Ed25519
    Permissions = 11,  // (integer) Bit value describing permissions of the
    // controller being added.
    // None (0x00): Regular user
    // Bit 1 (0x01): Admin that is able to add and remove
    // pairings against the accessory
    FragmentData = 12, // (bytes) Non-last fragment of data. If length is 0,
    // it's an ACK.
    FragmentLast = 13, // (bytes) Last fragment of data
    Flags = 19,        // (integer) Pairing type flags
    Separator = 0xffu8,
}

#[derive(Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Val {
    Method(u8) = 0,
    Identifier(Vec<u8>) = 1,
    Salt(Vec<u8>) = 2,
    PublicKey(Vec<u8>) = 3,
    Proof(Vec<u8>) = 4,
    EncryptedData(Vec<u8>) = 5,
    State(u8) = 6,
    Error(u8) = 7,
    RetryDelay(u32) = 8,
    Signature(Vec<u8>) = 10,
    Permissions(u8) = 11,
    FragmentData(Vec<u8>) = 12,
    FragmentLast(Vec<u8>) = 13,
    Flags(u8) = 19,
    Separator = 0xffu8,
}

impl Idx {
    pub const ENCRYPTED_DATA: u8 = Self::EncryptedData as u8;
    pub const ERROR: u8 = Self::Error as u8;
    pub const FLAGS: u8 = Self::Flags as u8;
    pub const FRAGMENT_DATA: u8 = Self::FragmentData as u8;
    pub const FRAGMENT_LAST: u8 = Self::FragmentLast as u8;
    pub const IDENTIFIER: u8 = Self::Identifier as u8;
    pub const METHOD: u8 = Self::Method as u8;
    pub const PERMISSIONS: u8 = Self::Permissions as u8;
    pub const PROOF: u8 = Self::Proof as u8;
    pub const PUBLIC_KEY: u8 = Self::PublicKey as u8;
    pub const RETRY_DELAY: u8 = Self::RetryDelay as u8;
    pub const SALT: u8 = Self::Salt as u8;
    pub const SEPARATOR: u8 = Self::Separator as u8;
    pub const SIGNATURE: u8 = Self::Signature as u8;
    pub const STATE: u8 = Self::State as u8;

    fn discriminant(self) -> u8 {
        self as u8
    }
}

/// Encoding helpers
fn tsb(id: u8, val: u8) -> Bytes {
    Bytes::copy_from_slice(&[id, 1, val])
}

fn tvb(id: u8, data: &[u8]) -> Bytes {
    const MAX_CHUNK: usize = u8::MAX as usize;
    const OVERHEAD: usize = 2;

    // zero-length values still carry a (tag, 0) header
    if data.is_empty() {
        return Bytes::copy_from_slice(&[id, 0]);
    }

    let chunks = data.len().div_ceil(MAX_CHUNK);
    let mut out = BytesMut::with_capacity(chunks * OVERHEAD + data.len());

    for c in data.chunks(MAX_CHUNK) {
        out.put_u8(id);
        out.put_u8(c.len() as u8); // chunks() bounds len at MAX_CHUNK
        out.extend_from_slice(c);
    }

    out.freeze()
}

impl Val {
    pub fn desc(&self) -> &'static str {
        match self {
            Method(_) => "Method",
            Identifier(_) => "Identifier",
            Salt(_) => "Salt",
            PublicKey(_) => "PublicKey",
            Proof(_) => "Proof",
            EncryptedData(_) => "EncryptedData",
            State(_) => "State",
            ErrorTag(_) => "Error",
            RetryDelay(_) => "RetryDelay",
            Signature(_) => "Signature",
            Permissions(_) => "Permissions",
            FragmentData(_) => "FragmentData",
            FragmentLast(_) => "FragmentLast",
            Flags(_) => "Flags",
            Separator => "Separator",
        }
    }

    pub fn idx(&self) -> u8 {
        match self {
            Method(_) => Idx::METHOD,
            Identifier(_) => Idx::IDENTIFIER,
            Salt(_) => Idx::SALT,
            PublicKey(_) => Idx::PUBLIC_KEY,
            Proof(_) => Idx::PROOF,
            EncryptedData(_) => Idx::ENCRYPTED_DATA,
            State(_) => Idx::STATE,
            ErrorTag(_) => Idx::ERROR,
            RetryDelay(_) => Idx::RETRY_DELAY,
            Signature(_) => Idx::SIGNATURE,
            Permissions(_) => Idx::PERMISSIONS,
            FragmentData(_) => Idx::FRAGMENT_DATA,
            FragmentLast(_) => Idx::FRAGMENT_LAST,
            Flags(_) => Idx::FLAGS,
            Separator => Idx::SEPARATOR,
        }
    }

    pub fn encode(self) -> Bytes {
        let tag_id = self.idx();

        match self {
            Method(n) | State(n) | ErrorTag(n) | Flags(n) | Permissions(n) => tsb(tag_id, n),
            RetryDelay(secs) => tvb(tag_id, &secs.to_le_bytes()),
            Identifier(data) | Salt(data) | PublicKey(data) | Proof(data) | EncryptedData(data)
            | Signature(data) | FragmentData(data) | FragmentLast(data) => tvb(tag_id, &data),
            Separator => Bytes::copy_from_slice(&[Idx::SEPARATOR, 0]),
        }
    }

    /// Merge a continuation chunk of the same tag into this value.
    pub fn extend(&mut self, more: Val) {
        if self.idx() == more.idx() {
            if let (
                Identifier(a) | Salt(a) | Proof(a) | Signature(a) | EncryptedData(a)
                | FragmentData(a) | FragmentLast(a) | PublicKey(a),
                Identifier(b) | Salt(b) | Proof(b) | Signature(b) | EncryptedData(b)
                | FragmentData(b) | FragmentLast(b) | PublicKey(b),
            ) = (self, more)
            {
                a.extend_from_slice(&b);
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Identifier(v) | Salt(v) | Proof(v) | EncryptedData(v) | FragmentData(v)
            | FragmentLast(v) | Signature(v) | PublicKey(v) => v.len(),
            Method(_) | State(_) | ErrorTag(_) | Flags(_) | Permissions(_) => 1,
            RetryDelay(_) => 4,
            Separator => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.desc())?;

        match self {
            Identifier(x) | Signature(x) | Salt(x) | Proof(x) | EncryptedData(x)
            | FragmentData(x) | FragmentLast(x) | PublicKey(x) => {
                write!(f, " {:?}", x.hex_dump())
            }
            RetryDelay(x) => write!(f, " {x}"),
            Method(x) | ErrorTag(x) | State(x) | Flags(x) | Permissions(x) => write!(f, " {x}"),
            Separator => Ok(()),
        }
    }
}

/// An ordered map of decoded tags.
///
/// A tag appears at most once; continuation chunks are merged during
/// decode. Encoding preserves insertion order.
#[derive(Default, Clone)]
pub struct Map(IndexMap<u8, Val>);

impl Map {
    pub fn encode(self) -> BytesMut {
        self.0
            .into_values()
            .map(Val::encode)
            .collect::<Vec<Bytes>>()
            .concat()
            .as_slice()
            .into()
    }

    pub fn push(&mut self, val: Val) {
        use indexmap::map::Entry;
        let idx = Val::idx(&val);

        match self.0.entry(idx) {
            Entry::Vacant(vacant) => {
                vacant.insert(val);
            }
            Entry::Occupied(mut occupied) => {
                let v = occupied.insert(val);
                tracing::warn!("replaced {v:?}");
            }
        }
    }

    pub fn get_cloned(&self, idx: Idx) -> Result<Val, Error> {
        self.0
            .get(&idx.discriminant())
            .cloned()
            .ok_or(Error::MalformedRecord("required tag not present"))
    }

    pub fn state(&self) -> Result<u8, Error> {
        if let Some(State(s)) = self.0.get(&Idx::STATE) {
            return Ok(*s);
        }

        Err(Error::MalformedRecord("state tag not present"))
    }

    pub fn method(&self) -> Result<u8, Error> {
        if let Some(Method(m)) = self.0.get(&Idx::METHOD) {
            return Ok(*m);
        }

        Err(Error::MalformedRecord("method tag not present"))
    }

    /// Byte-valued tag accessor shared by the handshake handlers.
    pub fn bytes(&self, idx: Idx) -> Result<&[u8], Error> {
        match self.0.get(&idx.discriminant()) {
            Some(
                Identifier(v) | Salt(v) | Proof(v) | EncryptedData(v) | Signature(v)
                | PublicKey(v) | FragmentData(v) | FragmentLast(v),
            ) => Ok(v),
            _ => Err(Error::MalformedRecord("byte tag not present")),
        }
    }

    pub fn public_key(&self) -> Result<&[u8], Error> {
        self.bytes(Idx::PublicKey)
    }

    #[must_use]
    pub fn contains(&self, idx: Idx) -> bool {
        self.0.contains_key(&idx.discriminant())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Bytes> for Map {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self, Error> {
        Map::try_from(BytesMut::from(&bytes[..]))
    }
}

impl TryFrom<BytesMut> for Map {
    type Error = Error;

    fn try_from(mut buf: BytesMut) -> Result<Self, Error> {
        let mut map: IndexMap<u8, Val> = IndexMap::new();

        while !buf.is_empty() {
            // fail closed on a truncated length prefix
            if buf.len() < 2 {
                return Err(Error::MalformedRecord("truncated length prefix"));
            }

            let tag = buf.get_u8();
            let tag_len = buf.get_u8() as usize;

            if buf.len() < tag_len {
                return Err(Error::MalformedRecord("value chunk shorter than declared"));
            }

            let val = match (tag, tag_len) {
                (Idx::METHOD, 1) => Val::Method(buf.get_u8()),
                (Idx::IDENTIFIER, len) => Val::Identifier(buf.copy_to_bytes(len).to_vec()),
                (Idx::SALT, len) => Val::Salt(buf.copy_to_bytes(len).to_vec()),
                (Idx::PUBLIC_KEY, len) => Val::PublicKey(buf.copy_to_bytes(len).to_vec()),
                (Idx::PROOF, len) => Val::Proof(buf.copy_to_bytes(len).to_vec()),
                (Idx::ENCRYPTED_DATA, len) => Val::EncryptedData(buf.copy_to_bytes(len).to_vec()),
                (Idx::STATE, 1) => Val::State(buf.get_u8()),
                (Idx::ERROR, 1) => Val::Error(buf.get_u8()),
                (Idx::RETRY_DELAY, 4) => Val::RetryDelay(buf.get_u32_le()),
                (Idx::SIGNATURE, len) => Val::Signature(buf.copy_to_bytes(len).to_vec()),
                (Idx::PERMISSIONS, 1) => Val::Permissions(buf.get_u8()),
                (Idx::FRAGMENT_DATA, len) => Val::FragmentData(buf.copy_to_bytes(len).to_vec()),
                (Idx::FRAGMENT_LAST, len) => Val::FragmentLast(buf.copy_to_bytes(len).to_vec()),
                (Idx::FLAGS, 1) => Val::Flags(buf.get_u8()),
                (Idx::SEPARATOR, 0) => Val::Separator,

                // unknown tags (and known tags with an off-contract length)
                // are skipped, not rejected; the length prefix already
                // checked out so the chunk is consumed whole
                (tag, len) => {
                    debug!("skipping tag {tag} len {len}");
                    buf.advance(len);
                    continue;
                }
            };

            let idx = val.idx();

            if let Some(existing) = map.get_mut(&idx) {
                existing.extend(val);
            } else {
                map.insert(idx, val);
            }
        }

        Ok(Map(map))
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tag List\n")?;

        for item in self.0.values() {
            write!(f, "{item:?}")?;
            f.write_char('\n')?;
        }

        Ok(())
    }
}

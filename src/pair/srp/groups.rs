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

//! Group from [RFC 5054](https://tools.ietf.org/html/rfc5054).
//!
//! The pairing exchange mandates the 3072 bit group with g = 5; smaller
//! legacy groups are deliberately not provided.

use num_bigint::BigUint;
use once_cell::sync::Lazy;

/// RFC 5054 appendix A, 3072 bit prime.
const N_3072_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08",
    "8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B",
    "302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9",
    "A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6",
    "49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8",
    "FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C",
    "180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D",
    "04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D",
    "B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226",
    "1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC",
    "E0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF"
);

pub struct G {
    pub n: BigUint,
    pub g: BigUint,
    pub n_len: usize,
}

pub static G_3072: Lazy<G> = Lazy::new(G::build);

impl G {
    #[must_use]
    pub fn build() -> Self {
        let n = BigUint::parse_bytes(N_3072_HEX.as_bytes(), 16)
            .unwrap_or_else(|| unreachable!("embedded group constant"));

        G {
            n_len: N_3072_HEX.len() / 2,
            n,
            g: BigUint::from_bytes_be(&[5]),
        }
    }

    // k = H(N | PAD(g))
    #[must_use]
    pub fn compute_k(&self) -> BigUint {
        use hmac_sha512::Hash;

        let n = self.n.to_bytes_be();
        let g_bytes = self.g.to_bytes_be();

        let mut pad = vec![0u8; n.len()];
        pad[(n.len() - g_bytes.len())..].copy_from_slice(&g_bytes);

        let mut hasher = Hash::new();
        hasher.update(&n);
        hasher.update(&pad);

        BigUint::from_bytes_be(&hasher.finalize())
    }
}

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

//! SRP-6a server side (3072 bit group, g = 5, SHA-512).
//!
//! The verifier is rederived from the PIN at every stage 1 request; no
//! ephemeral or verifier state survives a failed attempt.

use crate::{
    tags::Val,
    Error,
};
use num_bigint::{BigUint, RandBigInt};
use num_traits::Zero;

pub mod groups;
use groups::G_3072;

pub const SALT_LEN: usize = 16;

/// One pairing attempt's server state. Field names follow the SRP papers.
#[allow(non_snake_case)]
pub struct Server {
    pub user: String,
    pub N: BigUint,
    pub g: BigUint,
    pub s: BigUint,
    pub x: BigUint,
    pub v: BigUint,
    pub b: BigUint,
    pub B: BigUint,
}

#[allow(non_snake_case)]
impl Server {
    /// Salt and the private ephemeral may be pinned for known-answer
    /// tests; production callers pass `None` for both.
    #[must_use]
    pub fn new(user: &str, password: &[u8], salt: Option<BigUint>, b: Option<BigUint>) -> Self {
        let N = G_3072.n.clone();
        let g = G_3072.g.clone();

        let s = salt.unwrap_or_else(|| random_uint(128));
        let x = compute_x(user, password, &s);
        let v = g.modpow(&x, &N);

        let b = b.unwrap_or_else(|| random_uint(256));
        let k = G_3072.compute_k();
        let B = (&k * &v + g.modpow(&b, &N)) % &N;

        Self {
            user: user.into(),
            N,
            g,
            s,
            x,
            v,
            b,
            B,
        }
    }

    pub fn salt(&self) -> Val {
        Val::Salt(pad_to(&self.s, SALT_LEN))
    }

    pub fn public_key(&self) -> Val {
        Val::PublicKey(pad_to(&self.B, G_3072.n_len))
    }
}

/// Verifies the client's stage 2 password proof and carries the server
/// proof plus the derived session key.
#[allow(non_snake_case)]
pub struct Verifier {
    pub A: BigUint,
    pub u: BigUint,
    /// K = H(S), the 64 byte SRP shared secret.
    pub session_key: Vec<u8>,
    /// Expected client proof.
    pub M_bytes: Vec<u8>,
    /// Server proof returned on success.
    pub H_AMK: Vec<u8>,
    client_M1: Vec<u8>,
}

#[allow(non_snake_case)]
impl Verifier {
    pub fn new(server: &Server, client_pk: &[u8], client_proof: &[u8]) -> Result<Self, Error> {
        let A = BigUint::from_bytes_be(client_pk);

        // reject A ≡ 0 (mod N), the classic zero-key attack
        if (&A % &server.N).is_zero() {
            return Err(Error::AuthenticationFailure("illegal client ephemeral"));
        }

        let u = H_nn_pad(&A, &server.B);
        let S = (&A * server.v.modpow(&u, &server.N)).modpow(&server.b, &server.N);
        let session_key = hash_bnum(&S);

        let M_bytes = calculate_M(
            server.user.as_bytes(),
            &server.s,
            &A,
            &server.B,
            &session_key,
        );
        let H_AMK = calculate_H_AMK(&A, &M_bytes, &session_key);

        Ok(Self {
            A,
            u,
            session_key,
            M_bytes,
            H_AMK,
            client_M1: client_proof.to_vec(),
        })
    }

    /// Compare the client's proof against ours. Both sides arrive at the
    /// same M only when they share the password and both ephemerals.
    pub fn authenticate(&self) -> Result<(), Error> {
        if self.M_bytes.len() == self.client_M1.len()
            && self
                .M_bytes
                .iter()
                .zip(self.client_M1.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
        {
            return Ok(());
        }

        Err(Error::AuthenticationFailure("password proof mismatch"))
    }

    pub fn proof(&self) -> Val {
        Val::Proof(self.H_AMK.clone())
    }
}

// x = H(s | H(I ":" P))
fn compute_x(user: &str, password: &[u8], s: &BigUint) -> BigUint {
    use hmac_sha512::Hash;

    let mut inner = Hash::new();
    inner.update(user.as_bytes());
    inner.update(b":");
    inner.update(password);
    let inner = inner.finalize();

    let mut outer = Hash::new();
    outer.update(pad_to(s, SALT_LEN));
    outer.update(inner);

    BigUint::from_bytes_be(&outer.finalize())
}

// M = H((H(N) xor H(g)) | H(I) | s | A | B | K)
#[allow(non_snake_case)]
fn calculate_M(I: &[u8], s: &BigUint, A: &BigUint, B: &BigUint, K: &[u8]) -> Vec<u8> {
    use hmac_sha512::Hash;

    let h_N = hash_slice(&G_3072.n.to_bytes_be());
    let h_g = hash_slice(&G_3072.g.to_bytes_be());
    let h_I = hash_slice(I);

    let h_xor: Vec<u8> = h_N.iter().zip(h_g.iter()).map(|(n0, n1)| n0 ^ n1).collect();

    let mut hasher = Hash::new();
    hasher.update(&h_xor);
    hasher.update(&h_I);
    hasher.update(pad_to(s, SALT_LEN));
    hasher.update(A.to_bytes_be());
    hasher.update(B.to_bytes_be());
    hasher.update(K);

    hasher.finalize().to_vec()
}

#[allow(non_snake_case)]
fn calculate_H_AMK(A: &BigUint, M: &[u8], K: &[u8]) -> Vec<u8> {
    use hmac_sha512::Hash;

    let mut hasher = Hash::new();
    hasher.update(A.to_bytes_be());
    hasher.update(M);
    hasher.update(K);

    hasher.finalize().to_vec()
}

// u = H(PAD(A) | PAD(B))
#[allow(non_snake_case)]
fn H_nn_pad(n0: &BigUint, n1: &BigUint) -> BigUint {
    use hmac_sha512::Hash;

    let mut hasher = Hash::new();
    hasher.update(pad_to(n0, G_3072.n_len));
    hasher.update(pad_to(n1, G_3072.n_len));

    BigUint::from_bytes_be(&hasher.finalize())
}

fn hash_bnum(n: &BigUint) -> Vec<u8> {
    hash_slice(&n.to_bytes_be())
}

fn hash_slice(s: &[u8]) -> Vec<u8> {
    hmac_sha512::Hash::hash(s).to_vec()
}

/// Big-endian bytes left-padded with zeros to `len`.
fn pad_to(n: &BigUint, len: usize) -> Vec<u8> {
    let be = n.to_bytes_be();

    let mut out = vec![0u8; len.saturating_sub(be.len())];
    out.extend_from_slice(&be);

    out
}

fn random_uint(bits: u64) -> BigUint {
    let mut rng = rand::thread_rng();

    rng.gen_biguint(bits)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{groups::G_3072, pad_to, Server, Verifier};
    use crate::Error;
    use num_bigint::BigUint;

    pub(crate) const USER: &str = "Pair-Setup";
    pub(crate) const PIN: &[u8] = b"031-45-154";

    /// Client side of the exchange, used only by tests. Mirrors the proof
    /// composition the server expects.
    #[allow(non_snake_case)]
    pub(crate) struct Client {
        pub A: BigUint,
        pub M: Vec<u8>,
        pub session_key: Vec<u8>,
    }

    #[allow(non_snake_case)]
    pub(crate) fn client_exchange(
        user: &str,
        password: &[u8],
        salt: &[u8],
        server_B: &[u8],
    ) -> Client {
        use super::{calculate_M, compute_x, hash_bnum, random_uint, H_nn_pad};

        let N = &G_3072.n;
        let g = &G_3072.g;

        let a = random_uint(256);
        let A = g.modpow(&a, N);

        let s = BigUint::from_bytes_be(salt);
        let B = BigUint::from_bytes_be(server_B);

        let x = compute_x(user, password, &s);
        let u = H_nn_pad(&A, &B);
        let k = G_3072.compute_k();

        // S = (B - k * g^x) ^ (a + u * x)
        let kg_x = (&k * g.modpow(&x, N)) % N;
        let base = ((&B + N) - kg_x) % N;
        let S = base.modpow(&(&a + &u * &x), N);

        let session_key = hash_bnum(&S);
        let M = calculate_M(user.as_bytes(), &s, &A, &B, &session_key);

        Client { A, M, session_key }
    }

    #[test]
    fn can_create_server() {
        let server = Server::new(USER, PIN, None, None);

        assert_eq!(server.N.to_bytes_be().len(), 384);
        assert_eq!(server.g.to_bytes_be().len(), 1);
        assert_eq!(server.x.to_bytes_be().len(), 64);
        assert!(server.v.bits() > 3000);
        assert_eq!(pad_to(&server.B, G_3072.n_len).len(), 384);
    }

    #[test]
    fn matching_pins_authenticate_and_agree_on_key() {
        let server = Server::new(USER, PIN, None, None);

        let client = client_exchange(
            USER,
            PIN,
            &pad_to(&server.s, super::SALT_LEN),
            &pad_to(&server.B, G_3072.n_len),
        );

        let verifier =
            Verifier::new(&server, &client.A.to_bytes_be(), &client.M).unwrap();

        verifier.authenticate().unwrap();
        assert_eq!(verifier.session_key, client.session_key);
    }

    #[test]
    fn wrong_pin_is_rejected() {
        let server = Server::new(USER, PIN, None, None);

        let client = client_exchange(
            USER,
            b"999-99-999",
            &pad_to(&server.s, super::SALT_LEN),
            &pad_to(&server.B, G_3072.n_len),
        );

        let verifier =
            Verifier::new(&server, &client.A.to_bytes_be(), &client.M).unwrap();

        assert!(matches!(
            verifier.authenticate(),
            Err(Error::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn zero_client_ephemeral_is_rejected() {
        let server = Server::new(USER, PIN, None, None);

        let res = Verifier::new(&server, &[0u8; 384], &[0u8; 64]);
        assert!(matches!(res, Err(Error::AuthenticationFailure(_))));
    }

    #[test]
    fn replayed_proof_fails_against_fresh_ephemerals() {
        // capture a valid stage 2 proof...
        let server = Server::new(USER, PIN, None, None);
        let client = client_exchange(
            USER,
            PIN,
            &pad_to(&server.s, super::SALT_LEN),
            &pad_to(&server.B, G_3072.n_len),
        );

        let verifier = Verifier::new(&server, &client.A.to_bytes_be(), &client.M).unwrap();
        verifier.authenticate().unwrap();

        // ...and replay it against a fresh stage 1: the shared secret
        // differs per session, so the proof no longer matches
        let fresh = Server::new(USER, PIN, None, None);
        let replayed = Verifier::new(&fresh, &client.A.to_bytes_be(), &client.M).unwrap();

        assert!(matches!(
            replayed.authenticate(),
            Err(Error::AuthenticationFailure(_))
        ));
    }
}

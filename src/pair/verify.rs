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

//! Pair-Verify: the per-connection key agreement run once a controller is
//! already paired. Fresh x25519 ephemerals both ways, mutual ed25519
//! authentication against the registry, session keys out the other side.

use crate::{
    cipher::{self, derive_key},
    registry::Registry,
    tags::{Idx, Val},
    Error, Tags,
};
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, VerifyingKey};

const ENCRYPT_SALT: &[u8] = b"Pair-Verify-Encrypt-Salt";
const ENCRYPT_INFO: &[u8] = b"Pair-Verify-Encrypt-Info";

const NONCE_M2: &[u8; 12] = b"\0\0\0\0PV-Msg02";
const NONCE_M3: &[u8; 12] = b"\0\0\0\0PV-Msg03";

#[derive(Default)]
pub struct Context {
    expect: u8,
    accessory_pub: Option<[u8; 32]>,
    controller_pub: Option<[u8; 32]>,
    shared_secret: Option<[u8; 32]>,
    session_key: Option<[u8; 32]>,
}

impl Context {
    #[must_use]
    pub fn build() -> Self {
        Self {
            expect: 1,
            ..Self::default()
        }
    }

    /// M1 -> M2: fresh ephemeral key agreement plus our signed, encrypted
    /// identity. The signature covers both ephemeral public keys so the
    /// response is useless outside this exchange.
    pub fn m1_m2(&mut self, t_in: &Tags, registry: &dyn Registry) -> Result<Tags, Error> {
        self.expect_stage(1)?;

        let controller_pub: [u8; 32] = t_in
            .public_key()?
            .try_into()
            .map_err(|_| Error::MalformedRecord("ephemeral key must be 32 bytes"))?;

        let eph = x25519_dalek::EphemeralSecret::random();
        let public = x25519_dalek::PublicKey::from(&eph);
        let shared = eph.diffie_hellman(&x25519_dalek::PublicKey::from(controller_pub));

        let sign_key = registry.signing_key();
        let accessory_id = registry.device_id();

        let mut signed = BytesMut::with_capacity(64 + accessory_id.len());
        signed.extend_from_slice(public.as_bytes());
        signed.extend_from_slice(accessory_id.as_bytes());
        signed.extend_from_slice(&controller_pub);

        let signature = sign_key
            .try_sign(&signed)
            .map_err(|_| Error::AuthenticationFailure("accessory signing failed"))?;

        let mut sub = Tags::default();
        sub.push(Val::Identifier(accessory_id.into_bytes()));
        sub.push(Val::Signature(signature.to_bytes().to_vec()));

        let session_key = derive_key(ENCRYPT_SALT, shared.as_bytes(), ENCRYPT_INFO);
        let sealed = super::seal(&session_key, NONCE_M2, sub.encode())?;

        let mut tags = Tags::default();
        tags.push(Val::State(2));
        tags.push(Val::PublicKey(public.as_bytes().to_vec()));
        tags.push(Val::EncryptedData(sealed));

        self.accessory_pub = Some(public.to_bytes());
        self.controller_pub = Some(controller_pub);
        self.shared_secret = Some(shared.to_bytes());
        self.session_key = Some(session_key);
        self.expect = 3;

        Ok(tags)
    }

    /// M3 -> M4: authenticate the controller against the registry and
    /// hand back the session cipher for this connection.
    ///
    /// The caller installs the cipher only after the M4 response has left
    /// in the clear.
    pub fn m3_m4(
        &mut self,
        t_in: &Tags,
        registry: &dyn Registry,
    ) -> Result<(Tags, cipher::Context), Error> {
        self.expect_stage(3)?;

        let (session_key, controller_pub, accessory_pub, shared_secret) = match (
            self.session_key.as_ref(),
            self.controller_pub.as_ref(),
            self.accessory_pub.as_ref(),
            self.shared_secret.as_ref(),
        ) {
            (Some(sk), Some(cp), Some(ap), Some(ss)) => (sk, cp, ap, ss),
            _ => return Err(Error::AuthenticationFailure("no stage 1 state")),
        };

        let clear = super::open(session_key, NONCE_M3, t_in.bytes(Idx::EncryptedData)?)?;
        let sub = Tags::try_from(clear)?;

        let id = sub.bytes(Idx::Identifier)?;
        let sig = sub.bytes(Idx::Signature)?;

        let pairing = registry
            .pairing(id)
            .ok_or(Error::AuthenticationFailure("unknown pairing identifier"))?;

        let mut signed = BytesMut::with_capacity(64 + id.len());
        signed.extend_from_slice(controller_pub);
        signed.extend_from_slice(id);
        signed.extend_from_slice(accessory_pub);

        let verifying_key = VerifyingKey::from_bytes(&pairing.public_key)
            .map_err(|_| Error::AuthenticationFailure("unusable long-term key"))?;
        let signature = Signature::from_slice(sig)
            .map_err(|_| Error::MalformedRecord("signature must be 64 bytes"))?;

        verifying_key
            .verify_strict(&signed, &signature)
            .map_err(|_| Error::AuthenticationFailure("identity signature mismatch"))?;

        let session_cipher = cipher::Context::new(shared_secret);

        let mut tags = Tags::default();
        tags.push(Val::State(4));

        // ephemeral state is spent; a new connection starts over
        self.expect = 0;

        Ok((tags, session_cipher))
    }

    fn expect_stage(&self, stage: u8) -> Result<(), Error> {
        if self.expect == stage {
            return Ok(());
        }

        Err(Error::AuthenticationFailure("stage out of sequence"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Context, ENCRYPT_INFO, ENCRYPT_SALT, NONCE_M2, NONCE_M3};
    use crate::{
        cipher::derive_key,
        pair::{open, seal},
        registry::{Memory, PairingIdentity, Registry, PERM_ADMIN},
        tags::{Idx, Val},
        Error, Tags,
    };
    use bytes::BytesMut;
    use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
    use std::sync::Arc;

    pub(crate) const CONTROLLER_ID: &[u8] = b"9F8A4E2B-1C3D-4A5E-8F60-AB12CD34EF56";

    pub(crate) struct Controller {
        pub signing_key: SigningKey,
        secret: Option<x25519_dalek::EphemeralSecret>,
        pub public: [u8; 32],
        pub session_key: Option<[u8; 32]>,
        pub shared_secret: Option<[u8; 32]>,
    }

    impl Controller {
        pub(crate) fn build() -> Self {
            let secret = x25519_dalek::EphemeralSecret::random();
            let public = x25519_dalek::PublicKey::from(&secret).to_bytes();

            Self {
                signing_key: SigningKey::from_bytes(&[3u8; 32]),
                secret: Some(secret),
                public,
                session_key: None,
                shared_secret: None,
            }
        }

        pub(crate) fn pair_with(&self, registry: &dyn Registry) {
            registry
                .save_pairing(PairingIdentity {
                    id: CONTROLLER_ID.to_vec(),
                    public_key: self.signing_key.verifying_key().to_bytes(),
                    permissions: PERM_ADMIN,
                })
                .unwrap();
        }

        pub(crate) fn m1(&self) -> Tags {
            let mut tags = Tags::default();
            tags.push(Val::State(1));
            tags.push(Val::PublicKey(self.public.to_vec()));

            tags
        }

        /// Digest M2 (checking the accessory identity) and produce M3.
        pub(crate) fn m3(&mut self, m2: &Tags, accessory_vk: &VerifyingKey) -> Tags {
            let accessory_pub: [u8; 32] = m2.public_key().unwrap().try_into().unwrap();

            let shared = self
                .secret
                .take()
                .unwrap()
                .diffie_hellman(&x25519_dalek::PublicKey::from(accessory_pub));

            let session_key = derive_key(ENCRYPT_SALT, shared.as_bytes(), ENCRYPT_INFO);

            // accessory signature covers eph keys + its identifier
            let clear = open(
                &session_key,
                NONCE_M2,
                m2.bytes(Idx::EncryptedData).unwrap(),
            )
            .unwrap();
            let sub = Tags::try_from(clear).unwrap();

            let acc_id = sub.bytes(Idx::Identifier).unwrap();
            let mut signed = BytesMut::new();
            signed.extend_from_slice(&accessory_pub);
            signed.extend_from_slice(acc_id);
            signed.extend_from_slice(&self.public);

            let sig = Signature::from_slice(sub.bytes(Idx::Signature).unwrap()).unwrap();
            accessory_vk.verify_strict(&signed, &sig).unwrap();

            // now our turn: sign controller-eph || id || accessory-eph
            let mut signed = BytesMut::new();
            signed.extend_from_slice(&self.public);
            signed.extend_from_slice(CONTROLLER_ID);
            signed.extend_from_slice(&accessory_pub);

            let signature = self.signing_key.sign(&signed);

            let mut sub = Tags::default();
            sub.push(Val::Identifier(CONTROLLER_ID.to_vec()));
            sub.push(Val::Signature(signature.to_bytes().to_vec()));

            let sealed = seal(&session_key, NONCE_M3, sub.encode()).unwrap();

            self.session_key = Some(session_key);
            self.shared_secret = Some(shared.to_bytes());

            let mut tags = Tags::default();
            tags.push(Val::State(3));
            tags.push(Val::EncryptedData(sealed));

            tags
        }
    }

    fn registry() -> Arc<Memory> {
        Memory::with_signing_key("AA:BB:CC:DD:EE:FF", SigningKey::from_bytes(&[9u8; 32]))
    }

    #[test]
    fn paired_controller_verifies_and_derives_session_keys() {
        let registry = registry();
        let mut controller = Controller::build();
        controller.pair_with(registry.as_ref());

        let mut ctx = Context::build();

        let m2 = ctx.m1_m2(&controller.m1(), registry.as_ref()).unwrap();
        assert_eq!(m2.state().unwrap(), 2);

        let m3 = controller.m3(&m2, &registry.signing_key().verifying_key());

        let (m4, mut accessory_cipher) = ctx.m3_m4(&m3, registry.as_ref()).unwrap();
        assert_eq!(m4.state().unwrap(), 4);

        // both sides hold the same shared secret and can derive the same
        // session key schedule
        let controller_cipher = crate::cipher::Context::new(&controller.shared_secret.unwrap());
        assert_eq!(controller_cipher.frames_out(), 0);

        let wire = accessory_cipher
            .encrypt(BytesMut::from(b"event".as_slice()))
            .unwrap();
        assert!(!wire.is_empty());
        assert_eq!(accessory_cipher.frames_out(), 1);
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        let registry = registry();
        let mut controller = Controller::build();
        // not paired: registry has no entry for this identifier

        let mut ctx = Context::build();
        let m2 = ctx.m1_m2(&controller.m1(), registry.as_ref()).unwrap();
        let m3 = controller.m3(&m2, &registry.signing_key().verifying_key());

        let res = ctx.m3_m4(&m3, registry.as_ref());
        assert!(matches!(res, Err(Error::AuthenticationFailure(_))));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let registry = registry();
        let mut controller = Controller::build();
        controller.pair_with(registry.as_ref());

        // the pairing on file belongs to someone else's key
        registry
            .save_pairing(PairingIdentity {
                id: CONTROLLER_ID.to_vec(),
                public_key: SigningKey::from_bytes(&[8u8; 32]).verifying_key().to_bytes(),
                permissions: PERM_ADMIN,
            })
            .unwrap();

        let mut ctx = Context::build();
        let m2 = ctx.m1_m2(&controller.m1(), registry.as_ref()).unwrap();
        let m3 = controller.m3(&m2, &registry.signing_key().verifying_key());

        let res = ctx.m3_m4(&m3, registry.as_ref());
        assert!(matches!(res, Err(Error::AuthenticationFailure(_))));
    }

    #[test]
    fn removed_pairing_no_longer_verifies() {
        let registry = registry();
        let mut controller = Controller::build();
        controller.pair_with(registry.as_ref());

        registry.remove_pairing(CONTROLLER_ID).unwrap();

        let mut ctx = Context::build();
        let m2 = ctx.m1_m2(&controller.m1(), registry.as_ref()).unwrap();
        let m3 = controller.m3(&m2, &registry.signing_key().verifying_key());

        let res = ctx.m3_m4(&m3, registry.as_ref());
        assert!(matches!(res, Err(Error::AuthenticationFailure(_))));
    }

    #[test]
    fn m3_before_m1_is_rejected() {
        let registry = registry();
        let mut ctx = Context::build();

        let res = ctx.m3_m4(&Tags::default(), registry.as_ref());
        assert!(matches!(res, Err(Error::AuthenticationFailure(_))));
    }
}

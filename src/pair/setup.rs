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

//! Pair-Setup: the five message password-authenticated exchange that
//! establishes long-term identities.
//!
//! Stage discipline is strict: each handler accepts only the deterministic
//! successor of the stage it last emitted. Any failure destroys this
//! context; the controller must restart from stage 1.

use super::srp;
use crate::{
    cipher::derive_key,
    registry::{PairingIdentity, Registry, PERM_ADMIN},
    tags::{Idx, Val},
    Error, Tags,
};
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, VerifyingKey};
use tracing::info;

const ENCRYPT_SALT: &[u8] = b"Pair-Setup-Encrypt-Salt";
const ENCRYPT_INFO: &[u8] = b"Pair-Setup-Encrypt-Info";
const CONTROLLER_SIGN_SALT: &[u8] = b"Pair-Setup-Controller-Sign-Salt";
const CONTROLLER_SIGN_INFO: &[u8] = b"Pair-Setup-Controller-Sign-Info";
const ACCESSORY_SIGN_SALT: &[u8] = b"Pair-Setup-Accessory-Sign-Salt";
const ACCESSORY_SIGN_INFO: &[u8] = b"Pair-Setup-Accessory-Sign-Info";

const NONCE_M5: &[u8; 12] = b"\0\0\0\0PS-Msg05";
const NONCE_M6: &[u8; 12] = b"\0\0\0\0PS-Msg06";

const USERNAME: &str = "Pair-Setup";

pub struct Context {
    pin: String,
    expect: u8,
    server: Option<srp::Server>,
    session_key: Option<Vec<u8>>,
}

impl Context {
    #[must_use]
    pub fn build(pin: impl Into<String>) -> Self {
        Self {
            pin: pin.into(),
            expect: 1,
            server: None,
            session_key: None,
        }
    }

    /// M1 -> M2: derive a fresh verifier from the PIN, answer with the
    /// salt and our public SRP ephemeral.
    ///
    /// The verifier is never cached across attempts; every M1 pays the
    /// full derivation.
    pub fn m1_m2(&mut self) -> Result<Tags, Error> {
        self.expect_stage(1)?;

        let server = srp::Server::new(USERNAME, self.pin.as_bytes(), None, None);

        let mut tags = Tags::default();
        tags.push(Val::State(2));
        tags.push(server.salt());
        tags.push(server.public_key());

        self.server = Some(server);
        self.expect = 3;

        Ok(tags)
    }

    /// M3 -> M4: recompute the shared secret from both ephemerals and
    /// check the controller's password proof; answer with ours.
    pub fn m3_m4(&mut self, t_in: &Tags) -> Result<Tags, Error> {
        self.expect_stage(3)?;

        let server = self
            .server
            .as_ref()
            .ok_or(Error::AuthenticationFailure("no stage 1 state"))?;

        let client_pk = t_in.public_key()?;
        let client_proof = t_in.bytes(Idx::Proof)?;

        let verifier = srp::Verifier::new(server, client_pk, client_proof)?;
        verifier.authenticate()?;

        let mut tags = Tags::default();
        tags.push(Val::State(4));
        tags.push(verifier.proof());

        self.session_key = Some(verifier.session_key);
        self.expect = 5;

        Ok(tags)
    }

    /// M5 -> M6: exchange signed long-term identities under a key derived
    /// from the SRP shared secret. The controller's identity is persisted
    /// only after its signature checks out.
    pub fn m5_m6(&mut self, t_in: &Tags, registry: &dyn Registry) -> Result<Tags, Error> {
        self.expect_stage(5)?;

        let k = self
            .session_key
            .as_deref()
            .ok_or(Error::AuthenticationFailure("no stage 3 state"))?;

        let envelope_key = derive_key(ENCRYPT_SALT, k, ENCRYPT_INFO);

        let clear = super::open(&envelope_key, NONCE_M5, t_in.bytes(Idx::EncryptedData)?)?;
        let sub = Tags::try_from(clear)?;

        let id = sub.bytes(Idx::Identifier)?;
        let ltpk: [u8; 32] = sub
            .public_key()?
            .try_into()
            .map_err(|_| Error::MalformedRecord("long-term key must be 32 bytes"))?;
        let sig = sub.bytes(Idx::Signature)?;

        // the signature binds the identity to this handshake instance:
        // the device-x material is derived from this session's K
        let device_x = derive_key(CONTROLLER_SIGN_SALT, k, CONTROLLER_SIGN_INFO);

        let mut signed = BytesMut::with_capacity(device_x.len() + id.len() + ltpk.len());
        signed.extend_from_slice(&device_x);
        signed.extend_from_slice(id);
        signed.extend_from_slice(&ltpk);

        let verifying_key = VerifyingKey::from_bytes(&ltpk)
            .map_err(|_| Error::AuthenticationFailure("unusable long-term key"))?;
        let signature = Signature::from_slice(sig)
            .map_err(|_| Error::MalformedRecord("signature must be 64 bytes"))?;

        verifying_key
            .verify_strict(&signed, &signature)
            .map_err(|_| Error::AuthenticationFailure("identity signature mismatch"))?;

        registry
            .save_pairing(PairingIdentity {
                id: id.to_vec(),
                public_key: ltpk,
                permissions: PERM_ADMIN,
            })
            .map_err(|e| Error::AccessoryOperation(e.to_string()))?;

        info!("paired controller {}", String::from_utf8_lossy(id));

        let tags = self.m6_identity(k, &envelope_key, registry)?;

        // handshake complete; nothing here is reusable
        self.server = None;
        self.session_key = None;
        self.expect = 0;

        Ok(tags)
    }

    fn m6_identity(
        &self,
        k: &[u8],
        envelope_key: &[u8; 32],
        registry: &dyn Registry,
    ) -> Result<Tags, Error> {
        let accessory_x = derive_key(ACCESSORY_SIGN_SALT, k, ACCESSORY_SIGN_INFO);

        let sign_key = registry.signing_key();
        let ltpk = sign_key.verifying_key();
        let accessory_id = registry.device_id();

        let mut signed = BytesMut::with_capacity(96 + accessory_id.len());
        signed.extend_from_slice(&accessory_x);
        signed.extend_from_slice(accessory_id.as_bytes());
        signed.extend_from_slice(ltpk.as_bytes());

        let signature = sign_key
            .try_sign(&signed)
            .map_err(|_| Error::AuthenticationFailure("accessory signing failed"))?;

        let mut sub = Tags::default();
        sub.push(Val::Identifier(accessory_id.into_bytes()));
        sub.push(Val::PublicKey(ltpk.as_bytes().to_vec()));
        sub.push(Val::Signature(signature.to_bytes().to_vec()));

        let sealed = super::seal(envelope_key, NONCE_M6, sub.encode())?;

        let mut tags = Tags::default();
        tags.push(Val::State(6));
        tags.push(Val::EncryptedData(sealed));

        Ok(tags)
    }

    fn expect_stage(&self, stage: u8) -> Result<(), Error> {
        if self.expect == stage {
            return Ok(());
        }

        Err(Error::AuthenticationFailure("stage out of sequence"))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Context, ACCESSORY_SIGN_INFO, ACCESSORY_SIGN_SALT, CONTROLLER_SIGN_INFO,
        CONTROLLER_SIGN_SALT, ENCRYPT_INFO, ENCRYPT_SALT, NONCE_M5, NONCE_M6, USERNAME,
    };
    use crate::{
        cipher::derive_key,
        pair::{open, seal, srp::tests as srp_tests},
        registry::{Memory, Registry},
        tags::{Idx, Val},
        Error, Tags,
    };
    use bytes::BytesMut;
    use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

    const PIN: &str = "031-45-154";
    const CONTROLLER_ID: &[u8] = b"9F8A4E2B-1C3D-4A5E-8F60-AB12CD34EF56";

    struct Controller {
        signing_key: SigningKey,
        session_key: Vec<u8>,
    }

    // drive M1..M4 from the controller side with the given pin
    fn run_pake(ctx: &mut Context, pin: &str) -> (Tags, Vec<u8>) {
        let m2 = ctx.m1_m2().unwrap();
        assert_eq!(m2.state().unwrap(), 2);

        let salt = m2.bytes(Idx::Salt).unwrap();
        let server_pk = m2.public_key().unwrap();

        let client = srp_tests::client_exchange(USERNAME, pin.as_bytes(), salt, server_pk);

        let mut m3 = Tags::default();
        m3.push(Val::State(3));
        m3.push(Val::PublicKey(client.A.to_bytes_be()));
        m3.push(Val::Proof(client.M.clone()));

        (m3, client.session_key)
    }

    fn m5_tags(controller: &Controller) -> Tags {
        let envelope_key = derive_key(ENCRYPT_SALT, &controller.session_key, ENCRYPT_INFO);
        let device_x = derive_key(
            CONTROLLER_SIGN_SALT,
            &controller.session_key,
            CONTROLLER_SIGN_INFO,
        );

        let ltpk = controller.signing_key.verifying_key();

        let mut signed = BytesMut::new();
        signed.extend_from_slice(&device_x);
        signed.extend_from_slice(CONTROLLER_ID);
        signed.extend_from_slice(ltpk.as_bytes());

        let signature = controller.signing_key.sign(&signed);

        let mut sub = Tags::default();
        sub.push(Val::Identifier(CONTROLLER_ID.to_vec()));
        sub.push(Val::PublicKey(ltpk.as_bytes().to_vec()));
        sub.push(Val::Signature(signature.to_bytes().to_vec()));

        let sealed = seal(&envelope_key, NONCE_M5, sub.encode()).unwrap();

        let mut tags = Tags::default();
        tags.push(Val::State(5));
        tags.push(Val::EncryptedData(sealed));

        tags
    }

    #[test]
    fn correct_pin_pairs_and_persists_identity() {
        let registry = Memory::new("AA:BB:CC:DD:EE:FF");
        let mut ctx = Context::build(PIN);

        let (m3, session_key) = run_pake(&mut ctx, PIN);
        let m4 = ctx.m3_m4(&m3).unwrap();
        assert_eq!(m4.state().unwrap(), 4);
        assert!(!m4.bytes(Idx::Proof).unwrap().is_empty());

        let controller = Controller {
            signing_key: SigningKey::from_bytes(&[7u8; 32]),
            session_key,
        };

        let m6 = ctx.m5_m6(&m5_tags(&controller), registry.as_ref()).unwrap();
        assert_eq!(m6.state().unwrap(), 6);

        // identity persisted
        let pairing = registry.pairing(CONTROLLER_ID).unwrap();
        assert_eq!(
            pairing.public_key,
            controller.signing_key.verifying_key().to_bytes()
        );

        // and the accessory's own identity verifies
        let envelope_key = derive_key(ENCRYPT_SALT, &controller.session_key, ENCRYPT_INFO);
        let clear = open(
            &envelope_key,
            NONCE_M6,
            m6.bytes(Idx::EncryptedData).unwrap(),
        )
        .unwrap();
        let sub = Tags::try_from(clear).unwrap();

        assert_eq!(
            sub.bytes(Idx::Identifier).unwrap(),
            registry.device_id().as_bytes()
        );

        let accessory_x = derive_key(
            ACCESSORY_SIGN_SALT,
            &controller.session_key,
            ACCESSORY_SIGN_INFO,
        );
        let mut signed = BytesMut::new();
        signed.extend_from_slice(&accessory_x);
        signed.extend_from_slice(registry.device_id().as_bytes());
        signed.extend_from_slice(sub.public_key().unwrap());

        let vk =
            VerifyingKey::from_bytes(sub.public_key().unwrap().try_into().unwrap()).unwrap();
        let sig = Signature::from_slice(sub.bytes(Idx::Signature).unwrap()).unwrap();
        vk.verify_strict(&signed, &sig).unwrap();
    }

    #[test]
    fn wrong_pin_fails_at_stage_two_and_persists_nothing() {
        let registry = Memory::new("AA:BB:CC:DD:EE:FF");
        let mut ctx = Context::build(PIN);

        let (m3, _) = run_pake(&mut ctx, "123-45-678");

        let res = ctx.m3_m4(&m3);
        assert!(matches!(res, Err(Error::AuthenticationFailure(_))));
        assert!(!registry.is_paired());
    }

    #[test]
    fn stages_out_of_sequence_are_rejected() {
        let mut ctx = Context::build(PIN);

        // M3 before M1
        let empty = Tags::default();
        assert!(matches!(
            ctx.m3_m4(&empty),
            Err(Error::AuthenticationFailure(_))
        ));

        // M5 straight after M2 skips the proof exchange
        ctx.m1_m2().unwrap();
        let registry = Memory::new("AA:BB:CC:DD:EE:FF");
        assert!(matches!(
            ctx.m5_m6(&empty, registry.as_ref()),
            Err(Error::AuthenticationFailure(_))
        ));
    }
}

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

//! Durable store of long-term identity keys.
//!
//! The embedding application supplies the implementation; the core only
//! depends on this contract. [`Memory`] is the reference implementation
//! used by the demo binary and the test suite.

use ed25519_dalek::SigningKey;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::info;

/// Admin bit: the controller may add and remove pairings.
pub const PERM_ADMIN: u8 = 0x01;

/// Invoked whenever the set of paired controllers changes, so the
/// advertisement can re-publish its paired/discoverable flag.
pub type PairingListener = Arc<dyn Fn() + Send + Sync>;

/// One paired controller: opaque identifier plus its long-term ed25519
/// verifying key.
///
/// Created by a successful Pair-Setup M5 exchange, read on every
/// Pair-Verify M3, removed by an authenticated remove-pairing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingIdentity {
    pub id: Vec<u8>,
    pub public_key: [u8; 32],
    pub permissions: u8,
}

/// Contract for the pairing store.
///
/// Implementations must tolerate concurrent access from arbitrarily many
/// connection tasks; a single internal serialization point is fine, these
/// operations are not hot-path.
pub trait Registry: Send + Sync {
    /// Stable accessory pairing identifier (the `id` TXT field).
    fn device_id(&self) -> String;

    /// The accessory's long-term ed25519 signing key.
    fn signing_key(&self) -> SigningKey;

    fn pairing(&self, id: &[u8]) -> Option<PairingIdentity>;

    fn save_pairing(&self, pairing: PairingIdentity) -> crate::Result<()>;

    fn remove_pairing(&self, id: &[u8]) -> crate::Result<()>;

    fn pairings(&self) -> Vec<PairingIdentity>;

    fn is_paired(&self) -> bool {
        !self.pairings().is_empty()
    }
}

/// In-memory registry. Pairings do not survive a restart; embedders that
/// need durability implement [`Registry`] over their own store.
pub struct Memory {
    device_id: String,
    signing_key: SigningKey,
    pairings: Mutex<HashMap<Vec<u8>, PairingIdentity>>,
}

impl Memory {
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Arc<Self> {
        use rand::RngCore;

        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);

        Self::with_signing_key(device_id, SigningKey::from_bytes(&seed))
    }

    #[must_use]
    pub fn with_signing_key(device_id: impl Into<String>, signing_key: SigningKey) -> Arc<Self> {
        info!(
            "accessory long-term public key {}",
            hex::encode(signing_key.verifying_key().as_bytes())
        );

        Arc::new(Self {
            device_id: device_id.into(),
            signing_key,
            pairings: Mutex::new(HashMap::new()),
        })
    }
}

impl Registry for Memory {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn signing_key(&self) -> SigningKey {
        self.signing_key.clone()
    }

    fn pairing(&self, id: &[u8]) -> Option<PairingIdentity> {
        self.pairings.lock().unwrap().get(id).cloned()
    }

    fn save_pairing(&self, pairing: PairingIdentity) -> crate::Result<()> {
        info!("pairing added: {}", String::from_utf8_lossy(&pairing.id));

        self.pairings
            .lock()
            .unwrap()
            .insert(pairing.id.clone(), pairing);

        Ok(())
    }

    fn remove_pairing(&self, id: &[u8]) -> crate::Result<()> {
        info!("pairing removed: {}", String::from_utf8_lossy(id));

        self.pairings.lock().unwrap().remove(id);

        Ok(())
    }

    fn pairings(&self) -> Vec<PairingIdentity> {
        self.pairings.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Memory, PairingIdentity, Registry, PERM_ADMIN};

    #[test]
    fn can_save_lookup_and_remove() {
        let registry = Memory::new("AA:BB:CC:DD:EE:FF");

        assert!(!registry.is_paired());

        let pairing = PairingIdentity {
            id: b"controller-one".to_vec(),
            public_key: [0x42u8; 32],
            permissions: PERM_ADMIN,
        };

        registry.save_pairing(pairing.clone()).unwrap();

        assert!(registry.is_paired());
        assert_eq!(registry.pairing(b"controller-one"), Some(pairing));
        assert!(registry.pairing(b"controller-two").is_none());

        registry.remove_pairing(b"controller-one").unwrap();
        assert!(registry.pairing(b"controller-one").is_none());
        assert!(!registry.is_paired());
    }
}

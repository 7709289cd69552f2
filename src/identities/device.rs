// Copyright 2026 The Lattice Project Developers
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

use serde::{Deserialize, Serialize};

use crate::{
    requests::PublishedDeviceKeys,
    types::{
        Curve25519PublicKey, DeviceId, Ed25519PublicKey, KeyError, SignedOneTimeKey, UserId,
    },
};

/// The local trust placed in a remote device.
///
/// Trust only changes through an explicit user decision; receiving new key
/// material never touches it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// The default state of every newly discovered device.
    Unverified,
    /// The user confirmed the device's identity keys out of band.
    Verified,
    /// The user refuses to encrypt for this device.
    Blocked,
}

/// The identity of a remote device: its long-term public keys and the local
/// trust we place in them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// The user the device belongs to.
    pub user_id: UserId,
    /// The unique id of the device.
    pub device_id: DeviceId,
    /// The Ed25519 key the device signs its published key material with.
    pub ed25519_key: Ed25519PublicKey,
    /// The Curve25519 key used for session key agreement with the device.
    pub curve25519_key: Curve25519PublicKey,
    trust_state: TrustState,
}

impl DeviceIdentity {
    /// Create a new, unverified device identity from the given keys.
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        ed25519_key: Ed25519PublicKey,
        curve25519_key: Curve25519PublicKey,
    ) -> Self {
        Self { user_id, device_id, ed25519_key, curve25519_key, trust_state: TrustState::Unverified }
    }

    /// Build a device identity from a fetched key bundle, checking the
    /// bundle's self-signature first.
    pub fn from_published(keys: &PublishedDeviceKeys) -> Result<Self, KeyError> {
        keys.verify()?;

        Ok(Self::new(
            keys.user_id.clone(),
            keys.device_id.clone(),
            keys.ed25519_key,
            keys.curve25519_key,
        ))
    }

    /// The local trust placed in this device.
    pub fn trust_state(&self) -> TrustState {
        self.trust_state
    }

    /// Whether the user refuses to encrypt for this device.
    pub fn is_blocked(&self) -> bool {
        self.trust_state == TrustState::Blocked
    }

    /// Whether the user confirmed this device's keys out of band.
    pub fn is_verified(&self) -> bool {
        self.trust_state == TrustState::Verified
    }

    pub(crate) fn set_trust_state(&mut self, trust_state: TrustState) {
        self.trust_state = trust_state;
    }

    /// Check that the given one-time key was signed by this device.
    pub fn verify_one_time_key(&self, signed: &SignedOneTimeKey) -> Result<(), KeyError> {
        let canonical =
            SignedOneTimeKey::canonical_form(&self.user_id, &self.device_id, &signed.key);

        self.ed25519_key.verify(&canonical, &signed.signature)
    }
}

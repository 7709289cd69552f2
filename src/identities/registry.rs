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

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::device::{DeviceIdentity, TrustState};
use crate::{
    error::{KeyExchangeError, SessionError},
    requests::PublishedDeviceKeys,
    store::{Changes, Store, StoreError},
    types::{DeviceId, UserId},
};

/// The registry of remote devices we know about.
///
/// Lookups go through an in-memory cache backed by the store; key bundles
/// fetched from the server are ingested through
/// [`DeviceRegistry::receive_device_keys`]. Trust is only ever mutated by
/// the explicit `verify`/`block`/`revoke` operations.
#[derive(Clone, Debug)]
pub struct DeviceRegistry {
    store: Store,
    devices: Arc<DashMap<(UserId, DeviceId), DeviceIdentity>>,
}

impl DeviceRegistry {
    pub(crate) fn new(store: Store) -> Self {
        Self { store, devices: Arc::new(DashMap::new()) }
    }

    /// Look up the identity of the given device, if we have seen it.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>, StoreError> {
        let cache_key = (user_id.clone(), device_id.clone());

        if let Some(device) = self.devices.get(&cache_key) {
            return Ok(Some(device.clone()));
        }

        let device = self.store.get_device(user_id, device_id).await?;
        if let Some(device) = &device {
            self.devices.insert(cache_key, device.clone());
        }

        Ok(device)
    }

    /// Ingest a fetched device key bundle.
    ///
    /// The bundle's self-signature is checked before anything is stored. If
    /// the device is already known with different identity keys the new
    /// bundle is ignored; identity keys never change for the lifetime of a
    /// device, so a changed key means a compromised server or a wiped
    /// device, and neither may silently take over existing trust.
    pub async fn receive_device_keys(
        &self,
        keys: &PublishedDeviceKeys,
    ) -> Result<DeviceIdentity, KeyExchangeError> {
        let device = DeviceIdentity::from_published(keys)?;

        if let Some(existing) = self.get_device(&device.user_id, &device.device_id).await? {
            if existing.ed25519_key != device.ed25519_key
                || existing.curve25519_key != device.curve25519_key
            {
                warn!(
                    user_id = %device.user_id,
                    device_id = %device.device_id,
                    "Received a key bundle with changed identity keys, ignoring it"
                );
            }

            return Ok(existing);
        }

        debug!(
            user_id = %device.user_id,
            device_id = %device.device_id,
            "Discovered a new device"
        );

        self.save_device(device.clone()).await?;

        Ok(device)
    }

    async fn save_device(&self, device: DeviceIdentity) -> Result<(), StoreError> {
        self.store
            .save_changes(Changes { devices: vec![device.clone()], ..Default::default() })
            .await?;
        self.devices.insert((device.user_id.clone(), device.device_id.clone()), device);

        Ok(())
    }

    async fn set_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: TrustState,
    ) -> Result<(), SessionError> {
        let Some(mut device) = self.get_device(user_id, device_id).await? else {
            return Err(SessionError::UnknownDevice(user_id.clone(), device_id.clone()));
        };

        debug!(%user_id, %device_id, ?trust_state, "Changing the trust state of a device");

        device.set_trust_state(trust_state);
        self.save_device(device).await?;

        Ok(())
    }

    /// Mark the given device as verified.
    ///
    /// This records the user's out-of-band confirmation of the device's
    /// identity keys.
    pub async fn verify_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), SessionError> {
        self.set_trust(user_id, device_id, TrustState::Verified).await
    }

    /// Block the given device, refusing any further encryption for it.
    pub async fn block_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), SessionError> {
        self.set_trust(user_id, device_id, TrustState::Blocked).await
    }

    /// Explicitly revoke a previous verification or block, returning the
    /// device to the unverified state.
    pub async fn revoke_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), SessionError> {
        self.set_trust(user_id, device_id, TrustState::Unverified).await
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{ratchet::Account, store::MemoryStore};

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Store::new(MemoryStore::new()))
    }

    fn bob() -> Account {
        Account::new(UserId::from("@bob:example.org"), DeviceId::from("BOBDEVICE"))
    }

    #[tokio::test]
    async fn received_devices_can_be_looked_up() {
        let registry = registry();
        let bob = bob();

        assert!(registry
            .get_device(bob.user_id(), bob.device_id())
            .await
            .unwrap()
            .is_none());

        registry.receive_device_keys(&bob.device_keys()).await.unwrap();

        let device = registry
            .get_device(bob.user_id(), bob.device_id())
            .await
            .unwrap()
            .expect("The ingested device should be known");

        assert_eq!(device.curve25519_key, bob.identity_keys().curve25519);
        assert_eq!(device.trust_state(), TrustState::Unverified);
    }

    #[tokio::test]
    async fn changed_identity_keys_are_ignored() {
        let registry = registry();
        let bob = bob();

        registry.receive_device_keys(&bob.device_keys()).await.unwrap();

        // The same device id reappears with fresh keys.
        let imposter = Account::new(bob.user_id().clone(), bob.device_id().clone());
        let device = registry.receive_device_keys(&imposter.device_keys()).await.unwrap();

        assert_eq!(device.curve25519_key, bob.identity_keys().curve25519);
    }

    #[tokio::test]
    async fn trust_survives_a_cache_miss() {
        let registry = registry();
        let bob = bob();

        registry.receive_device_keys(&bob.device_keys()).await.unwrap();
        registry.verify_device(bob.user_id(), bob.device_id()).await.unwrap();

        // A second registry over the same store starts with a cold cache.
        let fresh = DeviceRegistry::new(registry.store.clone());
        let device = fresh
            .get_device(bob.user_id(), bob.device_id())
            .await
            .unwrap()
            .expect("The device should have been persisted");

        assert_eq!(device.trust_state(), TrustState::Verified);
    }

    #[tokio::test]
    async fn trust_changes_are_explicit() {
        let registry = registry();
        let bob = bob();

        registry.receive_device_keys(&bob.device_keys()).await.unwrap();
        registry.block_device(bob.user_id(), bob.device_id()).await.unwrap();

        // Re-receiving the same key bundle must not lift the block.
        registry.receive_device_keys(&bob.device_keys()).await.unwrap();
        let device =
            registry.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        assert!(device.is_blocked());

        registry.revoke_trust(bob.user_id(), bob.device_id()).await.unwrap();
        let device =
            registry.get_device(bob.user_id(), bob.device_id()).await.unwrap().unwrap();
        assert_eq!(device.trust_state(), TrustState::Unverified);
    }

    #[tokio::test]
    async fn unknown_devices_cant_be_trusted() {
        let registry = registry();

        assert_matches!(
            registry
                .verify_device(&UserId::from("@nobody:example.org"), &DeviceId::from("GHOST"))
                .await,
            Err(SessionError::UnknownDevice(..))
        );
    }
}

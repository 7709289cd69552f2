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

//! Types and traits to implement the storage layer of the session manager.
//!
//! The storage layer is a plain key-value store with atomic batch
//! transactions. Everything above it — key layout, serialization, timeouts —
//! lives in the typed [`Store`] wrapper, so a [`KeyStore`] implementation
//! only has to provide `get`, `put` and `transaction`.

use std::{fmt::Debug, future::Future, io::Error as IoError, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::timeout;

use crate::{
    identities::DeviceIdentity,
    ratchet::{PickledAccount, PickledSession},
    types::{DeviceId, UserId},
};

mod caches;
pub(crate) mod locks;
mod memorystore;

pub(crate) use caches::SessionCache;
pub use memorystore::MemoryStore;

/// The error type used by the storage layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying store failed to read or write.
    #[error("can't read or write from the store: {0}")]
    Io(#[from] IoError),

    /// A value couldn't be serialized or deserialized.
    #[error("error serializing data for the store: {0}")]
    Serialization(#[from] SerdeError),

    /// The store didn't answer within the caller-supplied timeout. No
    /// partial commit may be assumed; the operation is treated as failed.
    #[error("the store didn't answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// A store-implementation specific error.
    #[error("the store backend failed: {0}")]
    Backend(String),

    /// A persisted pickle was written by an unsupported format version.
    #[error("the persisted session uses the unsupported pickle version {0}")]
    UnsupportedPickleVersion(u8),
}

/// Type alias for the result of storage operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// A single operation inside an atomic store transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert or replace the value under the given key.
    Put {
        /// The key the value is stored under.
        key: String,
        /// The serialized value.
        value: Vec<u8>,
    },
    /// Remove the value under the given key, if any.
    Delete {
        /// The key to remove.
        key: String,
    },
}

/// A key-value store with atomic batch transactions, used to persist the
/// session manager's state.
///
/// Implementations must apply a [`KeyStore::transaction`] batch atomically:
/// either every operation of the batch becomes durable or none does. Ratchet
/// state is only ever written through transactions, paired with the
/// encrypt/decrypt operation that produced it, so a half-applied batch would
/// permanently desynchronize a session with its remote party.
///
/// A started transaction must run to completion or deterministically fail;
/// implementations must not observe caller cancellation mid-commit.
#[async_trait]
pub trait KeyStore: Debug + Send + Sync {
    /// Load the value stored under the given key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store the value under the given key.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Apply the given batch of operations atomically.
    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()>;
}

/// A type that can be type-erased into `Arc<dyn KeyStore>`.
///
/// This trait is not meant to be implemented directly; it is automatically
/// implemented for everything that implements [`KeyStore`].
pub trait IntoKeyStore {
    #[doc(hidden)]
    fn into_key_store(self) -> Arc<dyn KeyStore>;
}

impl<T> IntoKeyStore for T
where
    T: KeyStore + 'static,
{
    fn into_key_store(self) -> Arc<dyn KeyStore> {
        Arc::new(self)
    }
}

impl<T> IntoKeyStore for Arc<T>
where
    T: KeyStore + 'static,
{
    fn into_key_store(self) -> Arc<dyn KeyStore> {
        self
    }
}

impl IntoKeyStore for Arc<dyn KeyStore> {
    fn into_key_store(self) -> Arc<dyn KeyStore> {
        self
    }
}

/// A set of changes that should be persisted in a single atomic store
/// transaction.
#[derive(Clone, Debug, Default)]
pub struct Changes {
    /// The new state of the local account, if it changed.
    pub account: Option<PickledAccount>,
    /// Device identities that were added or whose trust state changed.
    pub devices: Vec<DeviceIdentity>,
    /// Per-device-pair session lists that advanced.
    pub sessions: Vec<PairSessions>,
}

/// The full list of sessions shared with one remote device, stored as a
/// single record keyed by the device pair.
#[derive(Clone, Debug)]
pub struct PairSessions {
    /// The user the sessions are shared with.
    pub user_id: UserId,
    /// The device the sessions are shared with.
    pub device_id: DeviceId,
    /// The pickled sessions, oldest first.
    pub pickles: Vec<PickledSession>,
}

/// The default bound on how long a single store call may block on I/O.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCOUNT_KEY: &str = "account";

fn device_key(user_id: &UserId, device_id: &DeviceId) -> String {
    format!("device/{user_id}/{device_id}")
}

fn sessions_key(user_id: &UserId, device_id: &DeviceId) -> String {
    format!("sessions/{user_id}/{device_id}")
}

/// Typed wrapper around a [`KeyStore`] that owns the key layout, the
/// serialization format and the per-call timeout.
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<dyn KeyStore>,
    timeout: Duration,
}

impl Store {
    /// Wrap the given store using the [`DEFAULT_STORE_TIMEOUT`].
    pub fn new(store: impl IntoKeyStore) -> Self {
        Self::with_timeout(store, DEFAULT_STORE_TIMEOUT)
    }

    /// Wrap the given store, bounding every call by the given timeout.
    ///
    /// On expiry the call surfaces [`StoreError::Timeout`] and is treated as
    /// if the operation failed; no partial commit is assumed.
    pub fn with_timeout(store: impl IntoKeyStore, timeout: Duration) -> Self {
        Self { inner: store.into_key_store(), timeout }
    }

    async fn bounded<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        timeout(self.timeout, future).await.map_err(|_| StoreError::Timeout(self.timeout))?
    }

    async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = self.bounded(self.inner.get(key)).await?;

        value.map(|value| serde_json::from_slice(&value)).transpose().map_err(StoreError::from)
    }

    fn put_op(key: String, value: &impl Serialize) -> Result<StoreOp> {
        Ok(StoreOp::Put { key, value: serde_json::to_vec(value)? })
    }

    /// Load the previously stored local account, if any.
    pub async fn load_account(&self) -> Result<Option<PickledAccount>> {
        self.get_value(ACCOUNT_KEY).await
    }

    /// Load the stored identity of the given device, if any.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>> {
        self.get_value(&device_key(user_id, device_id)).await
    }

    /// Load all stored sessions shared with the given device, oldest first.
    pub async fn get_sessions(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<PickledSession>> {
        Ok(self.get_value(&sessions_key(user_id, device_id)).await?.unwrap_or_default())
    }

    /// Persist the given set of changes in one atomic transaction.
    pub async fn save_changes(&self, changes: Changes) -> Result<()> {
        let mut ops = Vec::new();

        if let Some(account) = &changes.account {
            ops.push(Self::put_op(ACCOUNT_KEY.to_owned(), account)?);
        }

        for device in &changes.devices {
            ops.push(Self::put_op(device_key(&device.user_id, &device.device_id), device)?);
        }

        for sessions in &changes.sessions {
            ops.push(Self::put_op(
                sessions_key(&sessions.user_id, &sessions.device_id),
                &sessions.pickles,
            )?);
        }

        if ops.is_empty() {
            return Ok(());
        }

        self.bounded(self.inner.transaction(ops)).await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::{KeyStore, MemoryStore, Result, Store, StoreError, StoreOp};
    use crate::{
        identities::{DeviceIdentity, TrustState},
        store::Changes,
        types::{Curve25519PublicKey, DeviceId, UserId},
    };

    /// A store that never answers, simulating stuck backend I/O.
    #[derive(Debug)]
    struct StuckStore;

    #[async_trait]
    impl KeyStore for StuckStore {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn put(&self, _: &str, _: Vec<u8>) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn transaction(&self, _: Vec<StoreOp>) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn example_device() -> DeviceIdentity {
        let curve = Curve25519PublicKey::from([1u8; 32]);
        let ed = crate::ratchet::Account::new(
            UserId::from("@alice:example.org"),
            DeviceId::from("ALICEDEVICE"),
        )
        .identity_keys()
        .ed25519;

        DeviceIdentity::new(
            UserId::from("@bob:example.org"),
            DeviceId::from("BOBDEVICE"),
            ed,
            curve,
        )
    }

    #[tokio::test]
    async fn device_storage_roundtrip() {
        let store = Store::new(MemoryStore::new());
        let device = example_device();

        assert!(store
            .get_device(&device.user_id, &device.device_id)
            .await
            .unwrap()
            .is_none());

        store
            .save_changes(Changes { devices: vec![device.clone()], ..Default::default() })
            .await
            .unwrap();

        let loaded = store
            .get_device(&device.user_id, &device.device_id)
            .await
            .unwrap()
            .expect("The device should have been persisted");

        assert_eq!(loaded.curve25519_key, device.curve25519_key);
        assert_eq!(loaded.trust_state(), TrustState::Unverified);
    }

    #[tokio::test]
    async fn empty_changes_are_a_no_op() {
        let store = Store::with_timeout(MemoryStore::new(), Duration::from_millis(10));

        store.save_changes(Changes::default()).await.unwrap();
    }

    #[tokio::test]
    async fn a_stuck_backend_surfaces_a_timeout() {
        let store = Store::with_timeout(StuckStore, Duration::from_millis(50));

        assert_matches!(store.load_account().await, Err(StoreError::Timeout(_)));

        let device = example_device();
        assert_matches!(
            store
                .save_changes(Changes { devices: vec![device], ..Default::default() })
                .await,
            Err(StoreError::Timeout(_))
        );
    }

    #[test]
    fn timeout_error_formats_the_duration() {
        let error = StoreError::Timeout(Duration::from_millis(250));

        assert!(error.to_string().contains("250ms"));
    }
}

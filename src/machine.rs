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

use tracing::{debug, instrument, warn};

use crate::{
    error::{KeyExchangeError, SessionError, SessionResult},
    identities::{DeviceIdentity, DeviceRegistry},
    ratchet::{Account, IdentityKeys, Message, RatchetMessage, Session, SessionConfig},
    requests::{
        FetchDeviceKeysRequest, PublishOneTimeKeysRequest, PublishedDeviceKeys, Transport,
    },
    session_manager::{KeyExchangeCoordinator, PreKeyOutcome},
    store::{Changes, MemoryStore, PairSessions, SessionCache, Store, StoreError},
    types::{DeviceId, SessionId, UserId},
};

/// State machine implementing the device to device encryption layer of the
/// SDK.
///
/// The manager owns the local [`Account`], the registry of remote devices
/// and all established [`Session`]s. Every ratchet advance is persisted in
/// an atomic store transaction before the in-memory session is updated, so a
/// storage failure always leaves the pre-operation state visible.
#[derive(Clone)]
pub struct SessionManager {
    account: Arc<Account>,
    store: Store,
    registry: DeviceRegistry,
    transport: Arc<dyn Transport>,
    key_exchange: KeyExchangeCoordinator,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("user_id", self.user_id())
            .field("device_id", self.device_id())
            .finish()
    }
}

impl SessionManager {
    /// Create a new memory backed session manager.
    ///
    /// The created manager keeps all keys only in memory; once the object is
    /// dropped the keys are lost.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this manager.
    ///
    /// * `device_id` - The unique id of the device that owns this manager.
    ///
    /// * `transport` - The collaborator carrying requests to the key server.
    pub async fn new(
        user_id: UserId,
        device_id: DeviceId,
        transport: impl Transport + 'static,
    ) -> SessionResult<Self> {
        Self::with_store(
            user_id,
            device_id,
            transport,
            Store::new(MemoryStore::new()),
            SessionConfig::default(),
        )
        .await
    }

    /// Create a new session manager on top of the given store.
    ///
    /// A previously persisted account is restored from the store; otherwise
    /// a fresh account with new identity keys is created and persisted.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this manager.
    ///
    /// * `device_id` - The unique id of the device that owns this manager.
    ///
    /// * `transport` - The collaborator carrying requests to the key server.
    ///
    /// * `store` - The typed store wrapper the manager persists to.
    ///
    /// * `config` - The ratchet tunables every new session is created with.
    pub async fn with_store(
        user_id: UserId,
        device_id: DeviceId,
        transport: impl Transport + 'static,
        store: Store,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        let account = match store.load_account().await? {
            Some(pickle) => {
                if pickle.user_id != user_id || pickle.device_id != device_id {
                    return Err(StoreError::Backend(format!(
                        "the store holds the account of device {} of user {}",
                        pickle.device_id, pickle.user_id,
                    ))
                    .into());
                }

                debug!(%user_id, %device_id, "Restored the account from the store");
                Account::from_pickle(pickle)
            }
            None => {
                let account = Account::new(user_id.clone(), device_id.clone());
                store
                    .save_changes(Changes {
                        account: Some(account.pickle()),
                        ..Default::default()
                    })
                    .await?;

                debug!(%user_id, %device_id, "Created a new account");
                account
            }
        };

        let account = Arc::new(account);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let registry = DeviceRegistry::new(store.clone());
        let key_exchange = KeyExchangeCoordinator::new(
            account.clone(),
            store.clone(),
            SessionCache::new(),
            registry.clone(),
            transport.clone(),
            config,
        );

        Ok(Self { account, store, registry, transport, key_exchange })
    }

    /// The unique id of the user that owns this manager.
    pub fn user_id(&self) -> &UserId {
        self.account.user_id()
    }

    /// The unique id of the device that owns this manager.
    pub fn device_id(&self) -> &DeviceId {
        self.account.device_id()
    }

    /// The public identity keys of the local device.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.account.identity_keys()
    }

    /// The self-signed key bundle of the local device, ready to be published.
    pub fn own_device_keys(&self) -> PublishedDeviceKeys {
        self.account.device_keys()
    }

    /// The registry of remote devices, for trust decisions.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Generate, sign and upload a batch of one-time keys.
    ///
    /// The private halves only become claimable once the server acknowledged
    /// the upload. Returns the number of unclaimed keys the server now holds
    /// for this device.
    #[instrument(skip(self))]
    pub async fn publish_one_time_keys(&self, count: usize) -> SessionResult<usize> {
        self.account.generate_one_time_keys(count);

        let request = PublishOneTimeKeysRequest {
            user_id: self.user_id().clone(),
            device_id: self.device_id().clone(),
            one_time_keys: self.account.signed_one_time_keys(),
        };

        let response = self
            .transport
            .send(request.into())
            .await
            .and_then(|response| response.into_publish())
            .map_err(KeyExchangeError::from)?;

        self.account.mark_keys_as_published();
        self.store
            .save_changes(Changes { account: Some(self.account.pickle()), ..Default::default() })
            .await?;

        debug!(
            uploaded = count,
            on_server = response.one_time_key_count,
            "Published a batch of one-time keys"
        );

        Ok(response.one_time_key_count)
    }

    /// Fetch and ingest the published device key bundles of a user.
    ///
    /// Bundles with an invalid self-signature are dropped; known devices
    /// keep their stored identity keys and trust state.
    #[instrument(skip(self))]
    pub async fn fetch_device_keys(
        &self,
        user_id: &UserId,
    ) -> SessionResult<Vec<DeviceIdentity>> {
        let response = self
            .transport
            .send(FetchDeviceKeysRequest { user_id: user_id.clone() }.into())
            .await
            .and_then(|response| response.into_device_keys())
            .map_err(KeyExchangeError::from)?;

        let mut devices = Vec::with_capacity(response.device_keys.len());

        for keys in &response.device_keys {
            match self.registry.receive_device_keys(keys).await {
                Ok(device) => devices.push(device),
                Err(error) => {
                    warn!(
                        user_id = %keys.user_id,
                        device_id = %keys.device_id,
                        %error,
                        "Ignoring an invalid device key bundle"
                    );
                }
            }
        }

        Ok(devices)
    }

    /// Make sure a session with the given device exists, establishing one
    /// through a one-time key claim if necessary.
    ///
    /// Returns the id of the canonical session for the pair. Concurrent
    /// calls for the same pair are serialized; the second caller attaches to
    /// the session the first one created.
    #[instrument(skip(self))]
    pub async fn establish_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> SessionResult<SessionId> {
        let session = self.key_exchange.get_or_establish(user_id, device_id).await?;

        Ok(session.session_id().clone())
    }

    /// The sessions currently shared with the given device.
    pub async fn sessions_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> SessionResult<Vec<Session>> {
        let slot = self.key_exchange.sessions(user_id, device_id).await?;
        let sessions = slot.lock().await;

        Ok(sessions.clone())
    }

    /// Encrypt the given plaintext for the given device.
    ///
    /// If no usable session with the device exists one is established first,
    /// which claims one of the device's one-time keys; the resulting message
    /// then carries the establishment key material until the remote device
    /// answers on the session.
    ///
    /// The advanced ratchet state is persisted before the message is handed
    /// out. If persistence fails the message is withheld and the session
    /// state remains at the pre-operation value, so no message key can reach
    /// the wire without its consumption being durable.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user to encrypt for.
    ///
    /// * `device_id` - The device of the user to encrypt for.
    ///
    /// * `plaintext` - The payload to encrypt.
    #[instrument(skip(self, plaintext))]
    pub async fn encrypt_for(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        plaintext: &[u8],
    ) -> SessionResult<Message> {
        if let Some(device) = self.registry.get_device(user_id, device_id).await? {
            if device.is_blocked() {
                return Err(SessionError::BlockedDevice(user_id.clone(), device_id.clone()));
            }
        }

        let session = self.key_exchange.get_or_establish(user_id, device_id).await?;

        let slot = self.key_exchange.sessions(user_id, device_id).await?;
        let mut sessions = slot.lock().await;

        let position = sessions
            .iter()
            .position(|candidate| candidate.session_id() == session.session_id())
            .ok_or_else(|| SessionError::UnknownSession {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
                session_id: session.session_id().clone(),
            })?;

        // Compute the advance on a copy; the live session is only replaced
        // once the store transaction went through.
        let mut updated = sessions[position].clone();
        let message = updated.encrypt(plaintext)?;

        self.save_pair(user_id, device_id, &sessions, position, &updated).await?;
        sessions[position] = updated;

        Ok(message)
    }

    /// Decrypt a message received from the given device.
    ///
    /// A pre-key message creates the missing inbound session on the fly,
    /// consuming the referenced one-time key atomically with the session's
    /// first persistence. A normal message for a session we don't have fails
    /// with [`SessionError::UnknownSession`]; only the sender can initiate
    /// the missing ratchet, so no session is auto-established here.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user the message came from.
    ///
    /// * `device_id` - The device of the user the message came from.
    ///
    /// * `message` - The received message.
    #[instrument(skip(self, message), fields(session_id = %message.session_id()))]
    pub async fn decrypt_from(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        message: &Message,
    ) -> SessionResult<Vec<u8>> {
        match message {
            Message::PreKey(pre_key) => {
                match self.key_exchange.receive_pre_key(user_id, device_id, pre_key).await? {
                    PreKeyOutcome::Created { plaintext, .. } => Ok(plaintext),
                    PreKeyOutcome::Existing => {
                        self.decrypt_with_existing(user_id, device_id, &pre_key.message).await
                    }
                }
            }
            Message::Normal(message) => {
                self.decrypt_with_existing(user_id, device_id, message).await
            }
        }
    }

    async fn decrypt_with_existing(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        message: &RatchetMessage,
    ) -> SessionResult<Vec<u8>> {
        let slot = self.key_exchange.sessions(user_id, device_id).await?;
        let mut sessions = slot.lock().await;

        let Some(position) = sessions
            .iter()
            .position(|candidate| candidate.session_id() == &message.session_id)
        else {
            return Err(SessionError::UnknownSession {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
                session_id: message.session_id.clone(),
            });
        };

        let mut updated = sessions[position].clone();
        let plaintext = updated.decrypt(message)?;

        self.save_pair(user_id, device_id, &sessions, position, &updated).await?;
        sessions[position] = updated;

        Ok(plaintext)
    }

    async fn save_pair(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sessions: &[Session],
        position: usize,
        updated: &Session,
    ) -> Result<(), StoreError> {
        let pickles = sessions
            .iter()
            .enumerate()
            .map(|(index, session)| {
                if index == position {
                    updated.pickle()
                } else {
                    session.pickle()
                }
            })
            .collect();

        self.store
            .save_changes(Changes {
                sessions: vec![PairSessions {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                    pickles,
                }],
                ..Default::default()
            })
            .await
    }
}

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

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{KeyExchangeError, SessionError},
    identities::{DeviceIdentity, DeviceRegistry},
    ratchet::{Account, PreKeyMessage, Session, SessionConfig, SessionStage},
    requests::{ClaimOneTimeKeyRequest, FetchDeviceKeysRequest, Transport},
    store::{locks::LockMap, Changes, PairSessions, SessionCache, Store},
    types::{DeviceId, UserId},
};

/// The outcome of handling an inbound pre-key message.
pub(crate) enum PreKeyOutcome {
    /// A new inbound session was created and the payload decrypted with it.
    Created {
        /// The decrypted payload of the pre-key message.
        plaintext: Vec<u8>,
    },
    /// A session with this id already exists, the message has to be
    /// decrypted through it instead.
    Existing,
}

/// Coordinates the creation of new sessions with remote devices.
///
/// Establishment is serialized per device pair: a second caller racing an
/// in-flight establishment waits on the pair's lock and then attaches to the
/// session the first caller created, so a race never burns more than one of
/// the remote device's one-time keys.
#[derive(Clone, Debug)]
pub(crate) struct KeyExchangeCoordinator {
    account: Arc<Account>,
    store: Store,
    sessions: SessionCache,
    registry: DeviceRegistry,
    transport: Arc<dyn Transport>,
    establishment_locks: LockMap,
    config: SessionConfig,
}

fn canonical_session(sessions: &[Session]) -> Option<&Session> {
    sessions
        .iter()
        .filter(|session| session.stage() != SessionStage::Exhausted)
        .min_by(|a, b| a.session_id().cmp(b.session_id()))
}

impl KeyExchangeCoordinator {
    pub(crate) fn new(
        account: Arc<Account>,
        store: Store,
        sessions: SessionCache,
        registry: DeviceRegistry,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self {
            account,
            store,
            sessions,
            registry,
            transport,
            establishment_locks: LockMap::new(),
            config,
        }
    }

    fn pair_key(user_id: &UserId, device_id: &DeviceId) -> String {
        format!("{user_id}/{device_id}")
    }

    /// Look up the given device, fetching the user's key bundles from the
    /// server if we have never seen it.
    async fn device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<DeviceIdentity, SessionError> {
        if let Some(device) = self.registry.get_device(user_id, device_id).await? {
            return Ok(device);
        }

        debug!(%user_id, %device_id, "The device is unknown, fetching the user's key bundles");

        let response = self
            .transport
            .send(FetchDeviceKeysRequest { user_id: user_id.clone() }.into())
            .await
            .and_then(|response| response.into_device_keys())
            .map_err(KeyExchangeError::from)?;

        for keys in &response.device_keys {
            if let Err(error) = self.registry.receive_device_keys(keys).await {
                warn!(
                    user_id = %keys.user_id,
                    device_id = %keys.device_id,
                    %error,
                    "Ignoring an invalid device key bundle"
                );
            }
        }

        self.registry
            .get_device(user_id, device_id)
            .await?
            .ok_or_else(|| SessionError::UnknownDevice(user_id.clone(), device_id.clone()))
    }

    /// Return the canonical session shared with the given device, creating
    /// one through a one-time key claim if none exists.
    ///
    /// Among coexisting sessions of a pair the canonical one is the session
    /// with the lexicographically smallest id; both parties derive session
    /// ids from the same establishment keys, so both converge on the same
    /// choice without further communication.
    pub(crate) async fn get_or_establish(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Session, SessionError> {
        let _guard =
            self.establishment_locks.lock(&Self::pair_key(user_id, device_id)).await;

        let slot =
            self.sessions.get_or_load(&self.store, self.config, user_id, device_id).await?;
        let mut sessions = slot.lock().await;

        if let Some(session) = canonical_session(&sessions) {
            return Ok(session.clone());
        }

        let device = self.device(user_id, device_id).await?;
        if device.is_blocked() {
            return Err(SessionError::BlockedDevice(user_id.clone(), device_id.clone()));
        }

        let signed_key = self
            .transport
            .send(
                ClaimOneTimeKeyRequest { user_id: user_id.clone(), device_id: device_id.clone() }
                    .into(),
            )
            .await
            .and_then(|response| response.into_claim())
            .map_err(KeyExchangeError::from)?
            .one_time_key
            .ok_or_else(|| {
                KeyExchangeError::NoOneTimeKeysAvailable(user_id.clone(), device_id.clone())
            })?;

        device
            .verify_one_time_key(&signed_key)
            .map_err(KeyExchangeError::InvalidSignature)?;

        let session = self.account.create_outbound_session(self.config, &device, &signed_key.key);

        info!(
            %user_id,
            %device_id,
            session_id = %session.session_id(),
            "Established a new outbound session"
        );

        self.persist_with(user_id, device_id, &sessions, &session).await?;
        sessions.push(session.clone());

        Ok(session)
    }

    /// Handle the pre-key message of a remote device.
    ///
    /// Creates the inbound session, decrypts the carried payload and
    /// persists the new session atomically with the consumption of our
    /// one-time key.
    pub(crate) async fn receive_pre_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        message: &PreKeyMessage,
    ) -> Result<PreKeyOutcome, SessionError> {
        let _guard =
            self.establishment_locks.lock(&Self::pair_key(user_id, device_id)).await;

        let slot =
            self.sessions.get_or_load(&self.store, self.config, user_id, device_id).await?;
        let mut sessions = slot.lock().await;

        // A repeated pre-key message for a session we already created; the
        // one-time key is long gone, the existing ratchet handles it.
        if sessions.iter().any(|session| session.session_id() == &message.message.session_id) {
            return Ok(PreKeyOutcome::Existing);
        }

        let device = self.device(user_id, device_id).await?;

        let result = self.account.create_inbound_session(self.config, &device, message)?;

        info!(
            %user_id,
            %device_id,
            session_id = %result.session.session_id(),
            "Created a new inbound session from a pre-key message"
        );

        self.persist_with(user_id, device_id, &sessions, &result.session).await?;
        sessions.push(result.session);

        Ok(PreKeyOutcome::Created { plaintext: result.plaintext })
    }

    /// Persist the current session list of a pair plus one new session, and
    /// the account state, in a single transaction.
    async fn persist_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sessions: &[Session],
        new_session: &Session,
    ) -> Result<(), SessionError> {
        let pickles = sessions
            .iter()
            .chain(std::iter::once(new_session))
            .map(Session::pickle)
            .collect();

        self.store
            .save_changes(Changes {
                account: Some(self.account.pickle()),
                sessions: vec![PairSessions {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                    pickles,
                }],
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// The session list of the given pair, loaded through the cache.
    pub(crate) async fn sessions(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Arc<Mutex<Vec<Session>>>, SessionError> {
        Ok(self.sessions.get_or_load(&self.store, self.config, user_id, device_id).await?)
    }
}

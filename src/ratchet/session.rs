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

use std::{collections::VecDeque, fmt};

use serde::{Deserialize, Serialize};

use super::{
    chain::{ChainKey, MessageKey},
    messages::{Message, PreKeyMessage, RatchetMessage},
};
use crate::{
    error::RatchetError,
    store::StoreError,
    types::{Curve25519PublicKey, DeviceId, OneTimeKeyId, SecondsSinceUnixEpoch, SessionId, UserId},
};

/// The current version of the persisted session format.
///
/// Bumped whenever [`RatchetState`] changes shape, so stored sessions from a
/// newer format are rejected instead of silently misread.
const SESSION_PICKLE_VERSION: u8 = 1;

/// Tunables of the per-session ratchet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How far ahead of the next expected receive index a single message may
    /// jump. Decrypting a message beyond this bound fails with
    /// [`RatchetError::TooManySkippedMessages`].
    pub max_skip: u64,
    /// How many skipped message keys are cached per session to tolerate
    /// out-of-order delivery. The oldest entries are irrecoverably dropped
    /// once the cache is full.
    pub max_cached_keys: usize,
    /// An optional cap on the number of messages a session may encrypt
    /// before it is considered exhausted and has to be re-established.
    pub max_sent_messages: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_skip: 1000, max_cached_keys: 2000, max_sent_messages: None }
    }
}

/// The lifecycle stage of a session's ratchet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    /// The chain keys are established but no message was sent or received.
    Fresh,
    /// At least one message was encrypted or decrypted.
    Active,
    /// The configured message cap was reached; the session still decrypts
    /// but refuses to encrypt.
    Exhausted,
}

/// Message keys that were derived but not yet consumed, kept around to
/// tolerate out-of-order delivery.
///
/// The cache is bounded; inserting into a full cache drops the oldest entry,
/// after which the matching message can never be decrypted again.
#[derive(Clone, Default, Serialize, Deserialize)]
struct SkippedMessageKeys {
    keys: VecDeque<MessageKey>,
}

impl SkippedMessageKeys {
    fn insert(&mut self, key: MessageKey, bound: usize) {
        self.keys.push_back(key);

        while self.keys.len() > bound {
            self.keys.pop_front();
        }
    }

    fn get(&self, index: u64) -> Option<MessageKey> {
        self.keys.iter().find(|key| key.index() == index).cloned()
    }

    fn remove(&mut self, index: u64) {
        self.keys.retain(|key| key.index() != index);
    }
}

/// The complete ratchet state of one session: the tagged lifecycle stage
/// plus the chain keys and the skipped-key cache.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct RatchetState {
    stage: SessionStage,
    send_chain: ChainKey,
    receive_chain: ChainKey,
    skipped: SkippedMessageKeys,
    sent_count: u64,
}

impl RatchetState {
    pub(crate) fn new(send_chain: ChainKey, receive_chain: ChainKey) -> Self {
        Self {
            stage: SessionStage::Fresh,
            send_chain,
            receive_chain,
            skipped: SkippedMessageKeys::default(),
            sent_count: 0,
        }
    }
}

/// The key material a pre-key message repeats until the session is
/// confirmed by the remote side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishmentInfo {
    /// Our Curve25519 identity key, we initiated the session.
    pub identity_key: Curve25519PublicKey,
    /// The ephemeral key that was generated for the establishment.
    pub base_key: Curve25519PublicKey,
    /// The one-time key of the remote device that was claimed.
    pub one_time_key_id: OneTimeKeyId,
}

/// A cryptographic session shared with exactly one remote device.
///
/// The session owns its ratchet state exclusively; the state advances
/// monotonically and no message key is ever derived twice. Sessions are
/// cheap to clone, which the [`SessionManager`] uses to compute a ratchet
/// advance before committing it.
///
/// [`SessionManager`]: crate::SessionManager
#[derive(Clone)]
pub struct Session {
    session_id: SessionId,
    user_id: UserId,
    device_id: DeviceId,
    sender_key: Curve25519PublicKey,
    establishment: Option<EstablishmentInfo>,
    state: RatchetState,
    config: SessionConfig,
    created_at: SecondsSinceUnixEpoch,
    last_used_at: SecondsSinceUnixEpoch,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("stage", &self.state.stage)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        user_id: UserId,
        device_id: DeviceId,
        sender_key: Curve25519PublicKey,
        establishment: Option<EstablishmentInfo>,
        send_chain: ChainKey,
        receive_chain: ChainKey,
        config: SessionConfig,
    ) -> Self {
        let now = SecondsSinceUnixEpoch::now();

        Self {
            session_id,
            user_id,
            device_id,
            sender_key,
            establishment,
            state: RatchetState::new(send_chain, receive_chain),
            config,
            created_at: now,
            last_used_at: now,
        }
    }

    /// The unique identifier of this session.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The user this session is shared with.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device this session is shared with.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The Curve25519 identity key of the remote device.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The lifecycle stage the ratchet is in.
    pub fn stage(&self) -> SessionStage {
        self.state.stage
    }

    /// When this session was created.
    pub fn created_at(&self) -> SecondsSinceUnixEpoch {
        self.created_at
    }

    /// When this session last encrypted or decrypted a message.
    pub fn last_used_at(&self) -> SecondsSinceUnixEpoch {
        self.last_used_at
    }

    /// Whether messages of this session still carry establishment key
    /// material.
    pub fn is_pre_key(&self) -> bool {
        self.establishment.is_some()
    }

    /// Encrypt the given plaintext, advancing the send chain.
    ///
    /// Never regresses and never reuses a message key. The caller must
    /// persist the advanced state together with handing out the ciphertext;
    /// this type doesn't talk to a store itself.
    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<Message, RatchetError> {
        if self.state.stage == SessionStage::Exhausted {
            return Err(RatchetError::SessionExhausted(self.state.sent_count));
        }

        if let Some(cap) = self.config.max_sent_messages {
            if self.state.sent_count >= cap {
                self.state.stage = SessionStage::Exhausted;
                return Err(RatchetError::SessionExhausted(self.state.sent_count));
            }
        }

        let message_key = self.state.send_chain.create_message_key();
        let message = RatchetMessage {
            session_id: self.session_id.clone(),
            index: message_key.index(),
            ciphertext: message_key.encrypt(plaintext),
        };

        self.state.sent_count += 1;
        if self.state.stage == SessionStage::Fresh {
            self.state.stage = SessionStage::Active;
        }
        self.last_used_at = SecondsSinceUnixEpoch::now();

        Ok(match &self.establishment {
            Some(info) => PreKeyMessage {
                identity_key: info.identity_key,
                base_key: info.base_key,
                one_time_key_id: info.one_time_key_id.clone(),
                message,
            }
            .into(),
            None => message.into(),
        })
    }

    /// Decrypt the given message, advancing the receive chain as needed.
    ///
    /// Messages older than the next expected index are served from the
    /// skipped-key cache; a miss there means the key was consumed or
    /// dropped and the message is permanently undecryptable. Messages newer
    /// than expected cause the intermediate keys to be derived and cached,
    /// bounded by [`SessionConfig::max_skip`]. A message that fails
    /// authentication leaves the ratchet untouched.
    pub(crate) fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, RatchetError> {
        let next_index = self.state.receive_chain.index();

        let plaintext = if message.index < next_index {
            let Some(message_key) = self.state.skipped.get(message.index) else {
                return Err(RatchetError::ReplayOrDesync { index: message.index });
            };

            let plaintext = message_key.decrypt(&message.ciphertext)?;
            self.state.skipped.remove(message.index);

            plaintext
        } else {
            let jump = message.index - next_index;
            if jump > self.config.max_skip {
                return Err(RatchetError::TooManySkippedMessages {
                    requested: jump,
                    bound: self.config.max_skip,
                });
            }

            // Advance on a scratch copy so an unauthenticated message can't
            // move the ratchet.
            let mut chain = self.state.receive_chain.clone();
            let mut skipped = Vec::with_capacity(jump as usize);
            while chain.index() < message.index {
                skipped.push(chain.create_message_key());
            }

            let plaintext = chain.create_message_key().decrypt(&message.ciphertext)?;

            self.state.receive_chain = chain;
            for key in skipped {
                self.state.skipped.insert(key, self.config.max_cached_keys);
            }

            plaintext
        };

        if self.state.stage == SessionStage::Fresh {
            self.state.stage = SessionStage::Active;
        }
        // The remote party provably has this session, no need to keep
        // attaching the establishment key material.
        self.establishment = None;
        self.last_used_at = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    /// Store the session as a serializable pickle.
    pub fn pickle(&self) -> PickledSession {
        PickledSession {
            version: SESSION_PICKLE_VERSION,
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            sender_key: self.sender_key,
            establishment: self.establishment.clone(),
            state: self.state.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        }
    }

    /// Restore a session from a previously stored pickle.
    pub fn from_pickle(pickle: PickledSession, config: SessionConfig) -> Result<Self, StoreError> {
        if pickle.version != SESSION_PICKLE_VERSION {
            return Err(StoreError::UnsupportedPickleVersion(pickle.version));
        }

        Ok(Self {
            session_id: pickle.session_id,
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            sender_key: pickle.sender_key,
            establishment: pickle.establishment,
            state: pickle.state,
            config,
            created_at: pickle.created_at,
            last_used_at: pickle.last_used_at,
        })
    }
}

/// A serializable version of a [`Session`], holding everything that needs to
/// be persisted to restore the session.
#[derive(Clone, Serialize, Deserialize)]
pub struct PickledSession {
    /// The version of the ratchet-state payload.
    pub version: u8,
    /// The unique identifier of the session.
    pub session_id: SessionId,
    /// The user the session is shared with.
    pub user_id: UserId,
    /// The device the session is shared with.
    pub device_id: DeviceId,
    /// The Curve25519 identity key of the remote device.
    pub sender_key: Curve25519PublicKey,
    /// The establishment key material, when still unconfirmed.
    pub establishment: Option<EstablishmentInfo>,
    pub(crate) state: RatchetState,
    /// When the session was created.
    pub created_at: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_used_at: SecondsSinceUnixEpoch,
}

impl fmt::Debug for PickledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledSession")
            .field("version", &self.version)
            .field("session_id", &self.session_id)
            .finish()
    }
}

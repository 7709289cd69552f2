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

use std::{collections::BTreeMap, fmt, sync::Mutex};

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::{
    chain::derive_initial_chains,
    messages::PreKeyMessage,
    session::{EstablishmentInfo, Session, SessionConfig},
};
use crate::{
    error::KeyExchangeError,
    identities::DeviceIdentity,
    requests::PublishedDeviceKeys,
    types::{
        Curve25519PublicKey, DeviceId, Ed25519PublicKey, Ed25519Signature, OneTimeKey,
        OneTimeKeyId, SessionId, SignedOneTimeKey, UserId,
    },
    utilities::{base64_decode, base64_encode},
};

/// The long-term public identity keys of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// The Ed25519 key used to sign published key material.
    pub ed25519: Ed25519PublicKey,
    /// The Curve25519 key used for session key agreement.
    pub curve25519: Curve25519PublicKey,
}

/// The private halves of the one-time keys this device has generated.
///
/// Keys move from `unpublished` to `published` once their public halves were
/// handed to the key server; only published keys can be referenced by an
/// inbound pre-key message. Either way a key is removed the moment it is
/// used.
#[derive(Default)]
struct OneTimeKeys {
    next_key_index: u64,
    unpublished: BTreeMap<OneTimeKeyId, StaticSecret>,
    published: BTreeMap<OneTimeKeyId, StaticSecret>,
}

/// The result of creating an inbound session from a pre-key message.
#[derive(Debug)]
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The decrypted payload of the pre-key message.
    pub plaintext: Vec<u8>,
}

/// The local device's cryptographic identity.
///
/// Holds the long-term Ed25519 signing key and X25519 agreement key as well
/// as the private halves of the published one-time keys, and creates new
/// outbound and inbound sessions with remote devices.
pub struct Account {
    user_id: UserId,
    device_id: DeviceId,
    signing_key: SigningKey,
    diffie_hellman_key: StaticSecret,
    identity_keys: IdentityKeys,
    one_time_keys: Mutex<OneTimeKeys>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .finish()
    }
}

/// Compute the id of the session the given establishment keys produce.
///
/// Both parties of an establishment hold the same three public keys, so both
/// derive the same id without further communication.
pub(crate) fn session_id_for(
    identity_key: &Curve25519PublicKey,
    base_key: &Curve25519PublicKey,
    one_time_key: &Curve25519PublicKey,
) -> SessionId {
    let mut hasher = Sha256::new();
    hasher.update(b"LATTICE_SESSION_ID");
    hasher.update(identity_key.as_bytes());
    hasher.update(base_key.as_bytes());
    hasher.update(one_time_key.as_bytes());

    SessionId::from(base64_encode(hasher.finalize()))
}

fn triple_diffie_hellman(
    first: ([u8; 32], [u8; 32]),
    second: ([u8; 32], [u8; 32]),
    third: ([u8; 32], [u8; 32]),
) -> [u8; 96] {
    fn agree((secret, public): ([u8; 32], [u8; 32])) -> [u8; 32] {
        StaticSecret::from(secret).diffie_hellman(&X25519PublicKey::from(public)).to_bytes()
    }

    let mut shared = [0u8; 96];
    shared[..32].copy_from_slice(&agree(first));
    shared[32..64].copy_from_slice(&agree(second));
    shared[64..].copy_from_slice(&agree(third));

    shared
}

impl Account {
    /// Create a fresh account with newly generated identity keys.
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let diffie_hellman_key = StaticSecret::random_from_rng(OsRng);

        let identity_keys = IdentityKeys {
            ed25519: signing_key.verifying_key().into(),
            curve25519: X25519PublicKey::from(&diffie_hellman_key).into(),
        };

        Self {
            user_id,
            device_id,
            signing_key,
            diffie_hellman_key,
            identity_keys,
            one_time_keys: Mutex::new(OneTimeKeys::default()),
        }
    }

    /// The user this account belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of the device this account represents.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.identity_keys
    }

    /// Sign the given message with the account's Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        self.signing_key.sign(message).into()
    }

    /// The signed device key bundle other devices fetch to learn about us.
    pub fn device_keys(&self) -> PublishedDeviceKeys {
        let canonical = PublishedDeviceKeys::canonical_form(
            &self.user_id,
            &self.device_id,
            &self.identity_keys.ed25519,
            &self.identity_keys.curve25519,
        );

        PublishedDeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            ed25519_key: self.identity_keys.ed25519,
            curve25519_key: self.identity_keys.curve25519,
            signature: self.sign(&canonical),
        }
    }

    fn one_time_keys(&self) -> std::sync::MutexGuard<'_, OneTimeKeys> {
        self.one_time_keys.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Generate a batch of new one-time keys, returning their public halves.
    ///
    /// The keys stay in the unpublished bucket until
    /// [`Account::mark_keys_as_published`] is called.
    pub fn generate_one_time_keys(&self, count: usize) -> Vec<OneTimeKey> {
        let mut keys = self.one_time_keys();

        (0..count)
            .map(|_| {
                let key_id = OneTimeKeyId::from(base64_encode(keys.next_key_index.to_be_bytes()));
                keys.next_key_index = keys.next_key_index.wrapping_add(1);

                let secret = StaticSecret::random_from_rng(OsRng);
                let public_key = X25519PublicKey::from(&secret).into();
                keys.unpublished.insert(key_id.clone(), secret);

                OneTimeKey { key_id, public_key }
            })
            .collect()
    }

    /// The unpublished one-time keys, signed for upload.
    pub fn signed_one_time_keys(&self) -> Vec<SignedOneTimeKey> {
        self.one_time_keys()
            .unpublished
            .iter()
            .map(|(key_id, secret)| {
                let key = OneTimeKey {
                    key_id: key_id.clone(),
                    public_key: X25519PublicKey::from(secret).into(),
                };
                let canonical =
                    SignedOneTimeKey::canonical_form(&self.user_id, &self.device_id, &key);

                SignedOneTimeKey { key, signature: self.sign(&canonical) }
            })
            .collect()
    }

    /// Move all unpublished one-time keys to the published bucket.
    ///
    /// Called after the key server acknowledged the upload.
    pub fn mark_keys_as_published(&self) {
        let mut keys = self.one_time_keys();
        let unpublished = std::mem::take(&mut keys.unpublished);

        keys.published.extend(unpublished);
    }

    /// The number of one-time keys that are published but not yet consumed.
    pub fn published_one_time_key_count(&self) -> usize {
        self.one_time_keys().published.len()
    }

    /// Create a new outbound session to the given device, consuming the
    /// claimed one-time key of the remote device.
    pub fn create_outbound_session(
        &self,
        config: SessionConfig,
        device: &DeviceIdentity,
        one_time_key: &OneTimeKey,
    ) -> Session {
        let base_secret = StaticSecret::random_from_rng(OsRng);
        let base_key: Curve25519PublicKey = X25519PublicKey::from(&base_secret).into();

        let shared = triple_diffie_hellman(
            (self.diffie_hellman_key.to_bytes(), *one_time_key.public_key.as_bytes()),
            (base_secret.to_bytes(), *device.curve25519_key.as_bytes()),
            (base_secret.to_bytes(), *one_time_key.public_key.as_bytes()),
        );
        let (initiator_chain, responder_chain) = derive_initial_chains(&shared);

        let session_id = session_id_for(
            &self.identity_keys.curve25519,
            &base_key,
            &one_time_key.public_key,
        );
        let establishment = EstablishmentInfo {
            identity_key: self.identity_keys.curve25519,
            base_key,
            one_time_key_id: one_time_key.key_id.clone(),
        };

        Session::new(
            session_id,
            device.user_id.clone(),
            device.device_id.clone(),
            device.curve25519_key,
            Some(establishment),
            initiator_chain,
            responder_chain,
            config,
        )
    }

    /// Create an inbound session from the pre-key message of a remote device
    /// and decrypt the message's payload.
    ///
    /// The referenced one-time key is irreversibly removed, but only once the
    /// initial message authenticated; a bogus pre-key message can't burn our
    /// published keys.
    pub fn create_inbound_session(
        &self,
        config: SessionConfig,
        device: &DeviceIdentity,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, KeyExchangeError> {
        if message.identity_key != device.curve25519_key {
            return Err(KeyExchangeError::MismatchedIdentityKeys(
                device.user_id.clone(),
                device.device_id.clone(),
            ));
        }

        let one_time_secret = {
            let keys = self.one_time_keys();
            let Some(secret) = keys.published.get(&message.one_time_key_id) else {
                return Err(KeyExchangeError::UnknownOneTimeKey(
                    message.one_time_key_id.clone(),
                ));
            };

            secret.clone()
        };
        let one_time_public: Curve25519PublicKey = X25519PublicKey::from(&one_time_secret).into();

        let session_id =
            session_id_for(&message.identity_key, &message.base_key, &one_time_public);
        if session_id != message.message.session_id {
            return Err(KeyExchangeError::MismatchedIdentityKeys(
                device.user_id.clone(),
                device.device_id.clone(),
            ));
        }

        let shared = triple_diffie_hellman(
            (one_time_secret.to_bytes(), *message.identity_key.as_bytes()),
            (self.diffie_hellman_key.to_bytes(), *message.base_key.as_bytes()),
            (one_time_secret.to_bytes(), *message.base_key.as_bytes()),
        );
        let (initiator_chain, responder_chain) = derive_initial_chains(&shared);

        let mut session = Session::new(
            session_id,
            device.user_id.clone(),
            device.device_id.clone(),
            device.curve25519_key,
            None,
            responder_chain,
            initiator_chain,
            config,
        );

        let plaintext = session.decrypt(&message.message)?;

        self.one_time_keys().published.remove(&message.one_time_key_id);

        Ok(InboundCreationResult { session, plaintext })
    }

    /// Store the account as a serializable pickle.
    pub fn pickle(&self) -> PickledAccount {
        let keys = self.one_time_keys();

        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            signing_key: PickledSigningKey(self.signing_key.clone()),
            diffie_hellman_key: PickledCurveSecret(self.diffie_hellman_key.clone()),
            next_key_index: keys.next_key_index,
            unpublished_one_time_keys: keys
                .unpublished
                .iter()
                .map(|(id, secret)| (id.clone(), PickledCurveSecret(secret.clone())))
                .collect(),
            published_one_time_keys: keys
                .published
                .iter()
                .map(|(id, secret)| (id.clone(), PickledCurveSecret(secret.clone())))
                .collect(),
        }
    }

    /// Restore an account from a previously stored pickle.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let signing_key = pickle.signing_key.0;
        let diffie_hellman_key = pickle.diffie_hellman_key.0;

        let identity_keys = IdentityKeys {
            ed25519: signing_key.verifying_key().into(),
            curve25519: X25519PublicKey::from(&diffie_hellman_key).into(),
        };

        Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            signing_key,
            diffie_hellman_key,
            identity_keys,
            one_time_keys: Mutex::new(OneTimeKeys {
                next_key_index: pickle.next_key_index,
                unpublished: pickle
                    .unpublished_one_time_keys
                    .into_iter()
                    .map(|(id, secret)| (id, secret.0))
                    .collect(),
                published: pickle
                    .published_one_time_keys
                    .into_iter()
                    .map(|(id, secret)| (id, secret.0))
                    .collect(),
            }),
        }
    }
}

/// An X25519 secret serialized as an unpadded base64 string.
#[derive(Clone)]
struct PickledCurveSecret(StaticSecret);

impl Serialize for PickledCurveSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64_encode(self.0.to_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PickledCurveSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; 32] = decode_secret(deserializer)?;

        Ok(Self(StaticSecret::from(bytes)))
    }
}

/// An Ed25519 signing key serialized as an unpadded base64 string.
#[derive(Clone)]
struct PickledSigningKey(SigningKey);

impl Serialize for PickledSigningKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64_encode(self.0.to_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PickledSigningKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; 32] = decode_secret(deserializer)?;

        Ok(Self(SigningKey::from_bytes(&bytes)))
    }
}

fn decode_secret<'de, D: Deserializer<'de>, const N: usize>(
    deserializer: D,
) -> Result<[u8; N], D::Error> {
    use serde::de::Error;

    let string = String::deserialize(deserializer)?;
    let decoded = base64_decode(string).map_err(D::Error::custom)?;

    decoded
        .try_into()
        .map_err(|_| D::Error::custom("the decoded secret has an invalid length"))
}

/// A serializable version of an [`Account`], holding everything that needs
/// to be persisted to restore the account.
#[derive(Clone, Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user the account belongs to.
    pub user_id: UserId,
    /// The id of the device the account represents.
    pub device_id: DeviceId,
    signing_key: PickledSigningKey,
    diffie_hellman_key: PickledCurveSecret,
    next_key_index: u64,
    unpublished_one_time_keys: BTreeMap<OneTimeKeyId, PickledCurveSecret>,
    published_one_time_keys: BTreeMap<OneTimeKeyId, PickledCurveSecret>,
}

impl fmt::Debug for PickledAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledAccount")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::ratchet::Message;

    fn account_pair() -> (Account, Account) {
        let alice =
            Account::new(UserId::from("@alice:example.org"), DeviceId::from("ALICEDEVICE"));
        let bob = Account::new(UserId::from("@bob:example.org"), DeviceId::from("BOBDEVICE"));

        (alice, bob)
    }

    fn device_for(account: &Account) -> DeviceIdentity {
        DeviceIdentity::new(
            account.user_id().clone(),
            account.device_id().clone(),
            account.identity_keys().ed25519,
            account.identity_keys().curve25519,
        )
    }

    fn claim_one_time_key(account: &Account) -> OneTimeKey {
        let mut keys = account.generate_one_time_keys(1);
        account.mark_keys_as_published();

        keys.pop().expect("We asked for a one-time key")
    }

    #[test]
    fn session_establishment_converges() {
        let (alice, bob) = account_pair();
        let one_time_key = claim_one_time_key(&bob);

        let mut outbound = alice.create_outbound_session(
            SessionConfig::default(),
            &device_for(&bob),
            &one_time_key,
        );
        assert!(outbound.is_pre_key());

        let message = assert_matches!(
            outbound.encrypt(b"hello from alice").unwrap(),
            Message::PreKey(message) => message
        );

        let InboundCreationResult { session: mut inbound, plaintext } = bob
            .create_inbound_session(SessionConfig::default(), &device_for(&alice), &message)
            .unwrap();

        assert_eq!(plaintext, b"hello from alice");
        assert_eq!(inbound.session_id(), outbound.session_id());

        // The answer travels the other direction and confirms the session.
        let answer = assert_matches!(
            inbound.encrypt(b"hello from bob").unwrap(),
            Message::Normal(message) => message
        );
        assert_eq!(outbound.decrypt(&answer).unwrap(), b"hello from bob");
        assert!(!outbound.is_pre_key());
    }

    #[test]
    fn one_time_keys_are_single_use() {
        let (alice, bob) = account_pair();
        let one_time_key = claim_one_time_key(&bob);

        let mut outbound = alice.create_outbound_session(
            SessionConfig::default(),
            &device_for(&bob),
            &one_time_key,
        );
        let message = assert_matches!(
            outbound.encrypt(b"first contact").unwrap(),
            Message::PreKey(message) => message
        );

        bob.create_inbound_session(SessionConfig::default(), &device_for(&alice), &message)
            .unwrap();
        assert_eq!(bob.published_one_time_key_count(), 0);

        assert_matches!(
            bob.create_inbound_session(SessionConfig::default(), &device_for(&alice), &message),
            Err(KeyExchangeError::UnknownOneTimeKey(_))
        );
    }

    #[test]
    fn unpublished_keys_can_not_be_referenced() {
        let (alice, bob) = account_pair();
        let one_time_key =
            bob.generate_one_time_keys(1).pop().expect("We asked for a one-time key");

        let mut outbound = alice.create_outbound_session(
            SessionConfig::default(),
            &device_for(&bob),
            &one_time_key,
        );
        let message = assert_matches!(
            outbound.encrypt(b"too early").unwrap(),
            Message::PreKey(message) => message
        );

        assert_matches!(
            bob.create_inbound_session(SessionConfig::default(), &device_for(&alice), &message),
            Err(KeyExchangeError::UnknownOneTimeKey(_))
        );
    }

    #[test]
    fn mismatched_identity_keys_are_rejected() {
        let (alice, bob) = account_pair();
        let (mallory, _) = account_pair();
        let one_time_key = claim_one_time_key(&bob);

        let mut outbound = alice.create_outbound_session(
            SessionConfig::default(),
            &device_for(&bob),
            &one_time_key,
        );
        let message = assert_matches!(
            outbound.encrypt(b"who am i").unwrap(),
            Message::PreKey(message) => message
        );

        // Bob believes the message came from mallory's device; the carried
        // identity key doesn't match.
        assert_matches!(
            bob.create_inbound_session(SessionConfig::default(), &device_for(&mallory), &message),
            Err(KeyExchangeError::MismatchedIdentityKeys(..))
        );
    }

    #[test]
    fn signed_one_time_keys_verify() {
        let (_, bob) = account_pair();
        bob.generate_one_time_keys(3);

        for signed in bob.signed_one_time_keys() {
            let canonical = SignedOneTimeKey::canonical_form(
                bob.user_id(),
                bob.device_id(),
                &signed.key,
            );

            bob.identity_keys()
                .ed25519
                .verify(&canonical, &signed.signature)
                .expect("Our own signature should verify");
        }
    }

    #[test]
    fn device_keys_verify() {
        let (alice, _) = account_pair();

        alice.device_keys().verify().expect("Our own device keys should verify");
    }

    #[test]
    fn pickle_roundtrip_preserves_the_one_time_keys() {
        let (alice, bob) = account_pair();
        let one_time_key = claim_one_time_key(&bob);

        let json = serde_json::to_string(&bob.pickle()).unwrap();
        let restored = Account::from_pickle(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.identity_keys(), bob.identity_keys());
        assert_eq!(restored.published_one_time_key_count(), 1);

        let mut outbound = alice.create_outbound_session(
            SessionConfig::default(),
            &device_for(&restored),
            &one_time_key,
        );
        let message = assert_matches!(
            outbound.encrypt(b"after restore").unwrap(),
            Message::PreKey(message) => message
        );

        let result = restored
            .create_inbound_session(SessionConfig::default(), &device_for(&alice), &message)
            .unwrap();

        assert_eq!(result.plaintext, b"after restore");
    }
}

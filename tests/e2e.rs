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

//! End to end tests wiring two session managers through an in-process key
//! server.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use assert_matches::assert_matches;
use async_trait::async_trait;
use lattice_sdk_crypto::{
    store::{MemoryStore, Store},
    types::{DeviceId, SignedOneTimeKey, UserId},
    ClaimOneTimeKeyResponse, FetchDeviceKeysResponse, IncomingResponse, Message,
    OutgoingRequest, PublishOneTimeKeysResponse, PublishedDeviceKeys, RatchetError,
    SessionConfig, SessionError, SessionManager, Transport, TransportError,
};

/// An in-process key server all managers of a test talk to.
#[derive(Debug, Default)]
struct KeyServer {
    device_keys: Mutex<HashMap<UserId, Vec<PublishedDeviceKeys>>>,
    one_time_keys: Mutex<HashMap<(UserId, DeviceId), Vec<SignedOneTimeKey>>>,
}

#[derive(Clone, Debug, Default)]
struct TestTransport {
    server: Arc<KeyServer>,
}

impl TestTransport {
    fn add_device(&self, keys: PublishedDeviceKeys) {
        self.server
            .device_keys
            .lock()
            .unwrap()
            .entry(keys.user_id.clone())
            .or_default()
            .push(keys);
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<IncomingResponse, TransportError> {
        match request {
            OutgoingRequest::PublishOneTimeKeys(request) => {
                let mut keys = self.server.one_time_keys.lock().unwrap();
                let bucket = keys.entry((request.user_id, request.device_id)).or_default();
                bucket.extend(request.one_time_keys);

                Ok(PublishOneTimeKeysResponse { one_time_key_count: bucket.len() }.into())
            }
            OutgoingRequest::ClaimOneTimeKey(request) => {
                let mut keys = self.server.one_time_keys.lock().unwrap();
                let one_time_key =
                    keys.get_mut(&(request.user_id, request.device_id)).and_then(Vec::pop);

                Ok(ClaimOneTimeKeyResponse { one_time_key }.into())
            }
            OutgoingRequest::FetchDeviceKeys(request) => {
                let device_keys = self
                    .server
                    .device_keys
                    .lock()
                    .unwrap()
                    .get(&request.user_id)
                    .cloned()
                    .unwrap_or_default();

                Ok(FetchDeviceKeysResponse { device_keys }.into())
            }
        }
    }
}

async fn manager_with(
    transport: &TestTransport,
    user_id: &str,
    device_id: &str,
    store: Store,
    config: SessionConfig,
) -> SessionManager {
    let manager = SessionManager::with_store(
        UserId::from(user_id),
        DeviceId::from(device_id),
        transport.clone(),
        store,
        config,
    )
    .await
    .expect("The manager should start on an empty store");

    transport.add_device(manager.own_device_keys());
    manager.publish_one_time_keys(10).await.expect("The key upload should succeed");

    manager
}

async fn manager(transport: &TestTransport, user_id: &str, device_id: &str) -> SessionManager {
    manager_with(
        transport,
        user_id,
        device_id,
        Store::new(MemoryStore::new()),
        SessionConfig::default(),
    )
    .await
}

async fn manager_pair() -> (SessionManager, SessionManager) {
    let transport = TestTransport::default();

    let alice = manager(&transport, "@alice:example.org", "ALICEDEVICE").await;
    let bob = manager(&transport, "@bob:example.org", "BOBDEVICE").await;

    (alice, bob)
}

#[tokio::test]
async fn sequential_messages_use_distinct_keys() {
    let (alice, bob) = manager_pair().await;

    let mut ciphertexts = std::collections::HashSet::new();

    for index in 0..16u32 {
        let plaintext = format!("message number {index}");
        let message = alice
            .encrypt_for(bob.user_id(), bob.device_id(), plaintext.as_bytes())
            .await
            .unwrap();

        let ciphertext = match &message {
            Message::PreKey(message) => message.message.ciphertext.clone(),
            Message::Normal(message) => message.ciphertext.clone(),
        };
        assert!(ciphertexts.insert(ciphertext), "Two messages shared a ciphertext");

        let decrypted =
            bob.decrypt_from(alice.user_id(), alice.device_id(), &message).await.unwrap();
        assert_eq!(decrypted, plaintext.as_bytes());
    }
}

#[tokio::test]
async fn out_of_order_delivery_is_tolerated() {
    let (alice, bob) = manager_pair().await;

    let m1 = alice.encrypt_for(bob.user_id(), bob.device_id(), b"one").await.unwrap();
    let m2 = alice.encrypt_for(bob.user_id(), bob.device_id(), b"two").await.unwrap();
    let m3 = alice.encrypt_for(bob.user_id(), bob.device_id(), b"three").await.unwrap();

    assert_eq!(bob.decrypt_from(alice.user_id(), alice.device_id(), &m2).await.unwrap(), b"two");
    assert_eq!(bob.decrypt_from(alice.user_id(), alice.device_id(), &m1).await.unwrap(), b"one");
    assert_eq!(
        bob.decrypt_from(alice.user_id(), alice.device_id(), &m3).await.unwrap(),
        b"three"
    );
}

#[tokio::test]
async fn the_skipped_key_bound_is_enforced() {
    let transport = TestTransport::default();

    let alice = manager(&transport, "@alice:example.org", "ALICEDEVICE").await;
    let bob = manager_with(
        &transport,
        "@bob:example.org",
        "BOBDEVICE",
        Store::new(MemoryStore::new()),
        SessionConfig { max_skip: 3, ..SessionConfig::default() },
    )
    .await;

    // The first message creates bob's inbound session, which inherits his
    // skip bound.
    let first = alice.encrypt_for(bob.user_id(), bob.device_id(), b"start").await.unwrap();
    bob.decrypt_from(alice.user_id(), alice.device_id(), &first).await.unwrap();

    let mut dropped = Vec::new();
    for _ in 0..4 {
        dropped.push(alice.encrypt_for(bob.user_id(), bob.device_id(), b"lost").await.unwrap());
    }
    let too_far = alice.encrypt_for(bob.user_id(), bob.device_id(), b"too far").await.unwrap();

    assert_matches!(
        bob.decrypt_from(alice.user_id(), alice.device_id(), &too_far).await,
        Err(SessionError::Ratchet(RatchetError::TooManySkippedMessages {
            requested: 4,
            bound: 3,
        }))
    );

    // Messages within the bound still arrive.
    assert_eq!(
        bob.decrypt_from(alice.user_id(), alice.device_id(), &dropped[3]).await.unwrap(),
        b"lost"
    );
}

#[tokio::test]
async fn concurrent_establishment_converges() {
    let (alice, bob) = manager_pair().await;

    let (first, second) = tokio::join!(
        alice.establish_session(bob.user_id(), bob.device_id()),
        alice.establish_session(bob.user_id(), bob.device_id()),
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(alice.sessions_with(bob.user_id(), bob.device_id()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn simultaneous_bidirectional_establishment_converges() {
    let (alice, bob) = manager_pair().await;

    // Both sides establish before either delivery arrives.
    let from_alice = alice.encrypt_for(bob.user_id(), bob.device_id(), b"ping").await.unwrap();
    let from_bob = bob.encrypt_for(alice.user_id(), alice.device_id(), b"pong").await.unwrap();

    assert_eq!(
        bob.decrypt_from(alice.user_id(), alice.device_id(), &from_alice).await.unwrap(),
        b"ping"
    );
    assert_eq!(
        alice.decrypt_from(bob.user_id(), bob.device_id(), &from_bob).await.unwrap(),
        b"pong"
    );

    // Two sessions coexist on both ends now; both sides pick the same
    // canonical one for sending.
    assert_eq!(alice.sessions_with(bob.user_id(), bob.device_id()).await.unwrap().len(), 2);
    assert_eq!(bob.sessions_with(alice.user_id(), alice.device_id()).await.unwrap().len(), 2);

    let from_alice = alice.encrypt_for(bob.user_id(), bob.device_id(), b"settled").await.unwrap();
    let from_bob = bob.encrypt_for(alice.user_id(), alice.device_id(), b"settled").await.unwrap();

    assert_eq!(from_alice.session_id(), from_bob.session_id());
    assert_eq!(
        bob.decrypt_from(alice.user_id(), alice.device_id(), &from_alice).await.unwrap(),
        b"settled"
    );
    assert_eq!(
        alice.decrypt_from(bob.user_id(), bob.device_id(), &from_bob).await.unwrap(),
        b"settled"
    );
}

#[tokio::test]
async fn sessions_survive_a_restart() {
    let transport = TestTransport::default();
    let alice_store = Arc::new(MemoryStore::new());

    let alice = manager_with(
        &transport,
        "@alice:example.org",
        "ALICEDEVICE",
        Store::new(alice_store.clone()),
        SessionConfig::default(),
    )
    .await;
    let bob = manager(&transport, "@bob:example.org", "BOBDEVICE").await;

    let message = alice.encrypt_for(bob.user_id(), bob.device_id(), b"before").await.unwrap();
    bob.decrypt_from(alice.user_id(), alice.device_id(), &message).await.unwrap();

    let identity_keys = alice.identity_keys();
    drop(alice);

    // A manager restored from the store continues the established session.
    let alice = SessionManager::with_store(
        UserId::from("@alice:example.org"),
        DeviceId::from("ALICEDEVICE"),
        transport.clone(),
        Store::new(alice_store),
        SessionConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(alice.identity_keys(), identity_keys);

    let message = alice.encrypt_for(bob.user_id(), bob.device_id(), b"after").await.unwrap();
    assert_eq!(
        bob.decrypt_from(alice.user_id(), alice.device_id(), &message).await.unwrap(),
        b"after"
    );
}

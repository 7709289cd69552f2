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

use aes_gcm::{aead::Aead, Aes256Gcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::RatchetError;

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const ADVANCEMENT_SEED: &[u8] = &[0x02];

const MESSAGE_KEY_INFO: &[u8] = b"LATTICE_RATCHET_MESSAGE_KEY";

/// A chain key of the hash ratchet.
///
/// Every advancement irreversibly replaces the key with
/// `HMAC-SHA256(key, 0x02)`; the message key of the current step is
/// `HMAC-SHA256(key, 0x01)`. Advancing never regresses, which is what gives
/// the chain its forward secrecy.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ChainKey {
    key: [u8; 32],
    index: u64,
}

impl ChainKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// The index of the next message key this chain will produce.
    pub fn index(&self) -> u64 {
        self.index
    }

    fn mac(&self, seed: &[u8]) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .expect("HMAC can be initialized with a key of any length");
        mac.update(seed);

        mac.finalize().into_bytes().into()
    }

    /// Derive the message key of the current step and advance the chain.
    pub fn create_message_key(&mut self) -> MessageKey {
        let message_key = MessageKey { key: self.mac(MESSAGE_KEY_SEED), index: self.index };

        self.key = self.mac(ADVANCEMENT_SEED);
        self.index += 1;

        message_key
    }
}

/// A single-use key protecting exactly one message.
///
/// The AES-256-GCM key and nonce are expanded from the ratchet output with
/// HKDF. Since a message key is derived at most once per chain index, the
/// nonce is unique per (chain, message) and may be deterministic.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKey {
    key: [u8; 32],
    index: u64,
}

impl MessageKey {
    /// The chain index this key was derived at.
    pub fn index(&self) -> u64 {
        self.index
    }

    fn expand(&self) -> ([u8; 32], [u8; 12]) {
        let hkdf = Hkdf::<Sha256>::new(None, &self.key);
        let mut expanded = [0u8; 44];
        hkdf.expand(MESSAGE_KEY_INFO, &mut expanded)
            .expect("The output length is valid for HKDF-SHA256");

        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&expanded[..32]);
        nonce.copy_from_slice(&expanded[32..]);
        expanded.zeroize();

        (key, nonce)
    }

    /// Encrypt the given plaintext, consuming the key.
    pub fn encrypt(self, plaintext: &[u8]) -> Vec<u8> {
        let (mut key, nonce) = self.expand();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .expect("AES-GCM encryption only fails for oversized plaintexts");
        key.zeroize();

        ciphertext
    }

    /// Authenticate and decrypt the given ciphertext, consuming the key.
    pub fn decrypt(self, ciphertext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let (mut key, nonce) = self.expand();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| RatchetError::Decryption);
        key.zeroize();

        plaintext
    }
}

/// Derive the initial pair of chain keys from the concatenated triple-DH
/// shared secrets of a session establishment.
///
/// Returns `(initiator_chain, responder_chain)`: the chain the initiating
/// device sends on, and the chain the responding device sends on. Both
/// parties call this with identical input and agree on both chains.
pub(crate) fn derive_initial_chains(shared_secrets: &[u8; 96]) -> (ChainKey, ChainKey) {
    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), shared_secrets);
    let mut expanded = [0u8; 64];
    hkdf.expand(b"LATTICE_ROOT_CHAIN", &mut expanded)
        .expect("The output length is valid for HKDF-SHA256");

    let mut initiator = [0u8; 32];
    let mut responder = [0u8; 32];
    initiator.copy_from_slice(&expanded[..32]);
    responder.copy_from_slice(&expanded[32..]);
    expanded.zeroize();

    (ChainKey::new(initiator), ChainKey::new(responder))
}

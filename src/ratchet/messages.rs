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
    types::{Curve25519PublicKey, OneTimeKeyId, SessionId},
    utilities::serde_base64,
};

/// An encrypted message belonging to an established session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// The id of the session the message belongs to.
    pub session_id: SessionId,
    /// The index of the message key that protects the payload.
    pub index: u64,
    /// The authenticated ciphertext.
    #[serde(with = "serde_base64")]
    pub ciphertext: Vec<u8>,
}

/// The first message(s) of a freshly established session.
///
/// A pre-key message carries the public key material the responding device
/// needs to derive the same session: the initiator's identity key, the
/// ephemeral base key of this establishment, and the id of the one-time key
/// that was claimed. The initiator keeps sending pre-key messages until it
/// has decrypted an answer on the session, proving the responder caught up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    /// The Curve25519 identity key of the initiating device.
    pub identity_key: Curve25519PublicKey,
    /// The ephemeral key the initiator generated for this establishment.
    pub base_key: Curve25519PublicKey,
    /// The id of the one-time key the initiator claimed.
    pub one_time_key_id: OneTimeKeyId,
    /// The encrypted payload.
    pub message: RatchetMessage,
}

/// Enum over the two message types a session can produce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A message that additionally carries session-establishment key
    /// material.
    PreKey(PreKeyMessage),
    /// A message belonging to a session both sides already have.
    Normal(RatchetMessage),
}

impl Message {
    /// The id of the session this message belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Message::PreKey(message) => &message.message.session_id,
            Message::Normal(message) => &message.session_id,
        }
    }

    /// Encode the message for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Messages always serialize to JSON")
    }

    /// Decode a message from its wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<PreKeyMessage> for Message {
    fn from(message: PreKeyMessage) -> Self {
        Message::PreKey(message)
    }
}

impl From<RatchetMessage> for Message {
    fn from(message: RatchetMessage) -> Self {
        Message::Normal(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let message: Message = RatchetMessage {
            session_id: SessionId::from("some-session"),
            index: 3,
            ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
        }
        .into();

        let decoded = Message::from_bytes(&message.to_bytes()).unwrap();

        assert_eq!(message, decoded);
        assert_eq!(decoded.session_id().as_str(), "some-session");
    }

    #[test]
    fn ciphertext_is_encoded_as_base64() {
        let message = RatchetMessage {
            session_id: SessionId::from("s"),
            index: 0,
            ciphertext: b"binary".to_vec(),
        };

        let json = serde_json::to_value(&message).unwrap();

        assert!(json["ciphertext"].is_string());
    }
}

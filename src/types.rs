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

//! Identifier newtypes and public-key wrappers used throughout the crate.
//!
//! All key types serialize as unpadded base64 strings so they can be embedded
//! directly in wire messages and store pickles.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::utilities::{base64_decode, base64_encode};

macro_rules! owned_identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from the given string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

owned_identifier!(
    /// The unique identifier of a user.
    UserId
);

owned_identifier!(
    /// The unique identifier of a user's device.
    DeviceId
);

owned_identifier!(
    /// The identifier of a published one-time key.
    OneTimeKeyId
);

owned_identifier!(
    /// The unique identifier of an encryption session between two devices.
    ///
    /// Session ids are derived from the initial key material of the session
    /// establishment, so both parties of a session compute the same id.
    SessionId
);

/// An error describing why key material or a signature couldn't be decoded or
/// verified.
#[derive(Error, Debug)]
pub enum KeyError {
    /// The key or signature wasn't valid base64.
    #[error("the key material couldn't be decoded: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded key material had an unexpected length.
    #[error("the key material has an invalid length, expected {expected}, got {got}")]
    InvalidLength {
        /// The expected length in bytes.
        expected: usize,
        /// The length we got.
        got: usize,
    },

    /// The Ed25519 key or signature was structurally invalid, or a signature
    /// check failed.
    #[error("the signature check failed: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),
}

fn decode_fixed<const N: usize>(input: &str) -> Result<[u8; N], KeyError> {
    let decoded = base64_decode(input)?;
    let got = decoded.len();

    decoded.try_into().map_err(|_| KeyError::InvalidLength { expected: N, got })
}

/// The public part of a Curve25519 key pair, used for Diffie-Hellman key
/// agreement.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct Curve25519PublicKey([u8; 32]);

impl Curve25519PublicKey {
    /// View the key as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode the key as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.0)
    }

    /// Decode a key from its unpadded base64 form.
    pub fn from_base64(input: &str) -> Result<Self, KeyError> {
        Ok(Self(decode_fixed(input)?))
    }
}

impl From<[u8; 32]> for Curve25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<x25519_dalek::PublicKey> for Curve25519PublicKey {
    fn from(key: x25519_dalek::PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl From<Curve25519PublicKey> for x25519_dalek::PublicKey {
    fn from(key: Curve25519PublicKey) -> Self {
        x25519_dalek::PublicKey::from(key.0)
    }
}

impl fmt::Display for Curve25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for Curve25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Curve25519PublicKey({})", self.to_base64())
    }
}

impl Serialize for Curve25519PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_base64().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Curve25519PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        Self::from_base64(&string).map_err(D::Error::custom)
    }
}

/// The public part of an Ed25519 key pair, used to sign published key
/// material.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519PublicKey(VerifyingKey);

impl Ed25519PublicKey {
    /// View the key as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Encode the key as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.0.as_bytes())
    }

    /// Decode a key from its unpadded base64 form.
    pub fn from_base64(input: &str) -> Result<Self, KeyError> {
        let bytes = decode_fixed(input)?;
        Ok(Self(VerifyingKey::from_bytes(&bytes)?))
    }

    /// Check that the given signature was created by the private part of this
    /// key over the given message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), KeyError> {
        Ok(self.0.verify_strict(message, &signature.0)?)
    }
}

impl From<VerifyingKey> for Ed25519PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl fmt::Display for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", self.to_base64())
    }
}

impl Serialize for Ed25519PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_base64().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Ed25519PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        Self::from_base64(&string).map_err(D::Error::custom)
    }
}

/// An Ed25519 signature over published key material.
#[derive(Clone)]
pub struct Ed25519Signature(Signature);

impl Ed25519Signature {
    /// Encode the signature as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.0.to_bytes())
    }

    /// Decode a signature from its unpadded base64 form.
    pub fn from_base64(input: &str) -> Result<Self, KeyError> {
        let bytes: [u8; 64] = decode_fixed(input)?;
        Ok(Self(Signature::from_bytes(&bytes)))
    }
}

impl From<Signature> for Ed25519Signature {
    fn from(signature: Signature) -> Self {
        Self(signature)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Signature({})", self.to_base64())
    }
}

impl Serialize for Ed25519Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_base64().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Ed25519Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        Self::from_base64(&string).map_err(D::Error::custom)
    }
}

/// A published one-time key, consumed exactly once by a peer to establish a
/// new session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKey {
    /// The unique id of the key within the publishing device's batch.
    pub key_id: OneTimeKeyId,
    /// The public part of the key.
    pub public_key: Curve25519PublicKey,
}

/// A one-time key together with the signature of the publishing device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// The one-time key itself.
    pub key: OneTimeKey,
    /// The Ed25519 signature of the publishing device over the canonical
    /// form of the key.
    pub signature: Ed25519Signature,
}

impl SignedOneTimeKey {
    /// The canonical byte sequence a device signs when publishing a one-time
    /// key. Both the signer and the verifier construct this independently.
    pub fn canonical_form(
        user_id: &UserId,
        device_id: &DeviceId,
        key: &OneTimeKey,
    ) -> Vec<u8> {
        format!("{}|{}|{}|{}", user_id, device_id, key.key_id, key.public_key).into_bytes()
    }
}

/// A timestamp in seconds since the unix epoch.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SecondsSinceUnixEpoch(pub u64);

impl SecondsSinceUnixEpoch {
    /// The current time.
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_secs())
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn curve25519_base64_roundtrip() {
        let key = Curve25519PublicKey::from([7u8; 32]);
        let decoded = Curve25519PublicKey::from_base64(&key.to_base64()).unwrap();

        assert_eq!(key, decoded);
    }

    #[test]
    fn curve25519_rejects_short_input() {
        let result = Curve25519PublicKey::from_base64("aGVsbG8");

        assert!(matches!(result, Err(KeyError::InvalidLength { expected: 32, got: 5 })));
    }

    #[test]
    fn identifiers_are_ordered_lexicographically() {
        let smaller = SessionId::from("AAAA");
        let bigger = SessionId::from("BBBB");

        assert!(smaller < bigger);
    }

    #[test]
    fn key_serde_roundtrip() {
        let key = Curve25519PublicKey::from([3u8; 32]);
        let json = serde_json::to_string(&key).unwrap();
        let decoded: Curve25519PublicKey = serde_json::from_str(&json).unwrap();

        assert_eq!(key, decoded);
    }
}

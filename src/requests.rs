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

//! Value objects describing the requests the session manager needs a
//! transport collaborator to carry out, and the matching responses.
//!
//! The crate never talks to a server itself; a [`Transport`] implementation
//! owns the wire format, authentication and routing. The requests are plain
//! serializable values so transports can be composed and tested freely.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::TransportError,
    types::{
        Curve25519PublicKey, DeviceId, Ed25519PublicKey, Ed25519Signature, KeyError,
        SignedOneTimeKey, UserId,
    },
};

/// A device's self-signed long-term key bundle, as published to and fetched
/// from the key server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishedDeviceKeys {
    /// The user the device belongs to.
    pub user_id: UserId,
    /// The unique id of the device.
    pub device_id: DeviceId,
    /// The Ed25519 signing key of the device.
    pub ed25519_key: Ed25519PublicKey,
    /// The Curve25519 agreement key of the device.
    pub curve25519_key: Curve25519PublicKey,
    /// The device's signature over the canonical form of the bundle.
    pub signature: Ed25519Signature,
}

impl PublishedDeviceKeys {
    /// The canonical byte sequence a device signs when publishing its keys.
    /// Both the signer and the verifier construct this independently.
    pub fn canonical_form(
        user_id: &UserId,
        device_id: &DeviceId,
        ed25519_key: &Ed25519PublicKey,
        curve25519_key: &Curve25519PublicKey,
    ) -> Vec<u8> {
        format!("{user_id}|{device_id}|{ed25519_key}|{curve25519_key}").into_bytes()
    }

    /// Check the bundle's self-signature.
    pub fn verify(&self) -> Result<(), KeyError> {
        let canonical = Self::canonical_form(
            &self.user_id,
            &self.device_id,
            &self.ed25519_key,
            &self.curve25519_key,
        );

        self.ed25519_key.verify(&canonical, &self.signature)
    }
}

/// Upload a batch of signed one-time keys for our own device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishOneTimeKeysRequest {
    /// The user publishing the keys.
    pub user_id: UserId,
    /// The device publishing the keys.
    pub device_id: DeviceId,
    /// The signed public halves of the keys.
    pub one_time_keys: Vec<SignedOneTimeKey>,
}

/// Claim a single one-time key of a remote device, consuming it server-side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimOneTimeKeyRequest {
    /// The user to claim a key from.
    pub user_id: UserId,
    /// The device to claim a key from.
    pub device_id: DeviceId,
}

/// Fetch the published device key bundles of a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchDeviceKeysRequest {
    /// The user whose devices we want to learn about.
    pub user_id: UserId,
}

/// Enum over the requests the session manager hands to its transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OutgoingRequest {
    /// Upload one-time keys for our own device.
    PublishOneTimeKeys(PublishOneTimeKeysRequest),
    /// Claim a one-time key of a remote device.
    ClaimOneTimeKey(ClaimOneTimeKeyRequest),
    /// Fetch the device key bundles of a user.
    FetchDeviceKeys(FetchDeviceKeysRequest),
}

impl From<PublishOneTimeKeysRequest> for OutgoingRequest {
    fn from(request: PublishOneTimeKeysRequest) -> Self {
        Self::PublishOneTimeKeys(request)
    }
}

impl From<ClaimOneTimeKeyRequest> for OutgoingRequest {
    fn from(request: ClaimOneTimeKeyRequest) -> Self {
        Self::ClaimOneTimeKey(request)
    }
}

impl From<FetchDeviceKeysRequest> for OutgoingRequest {
    fn from(request: FetchDeviceKeysRequest) -> Self {
        Self::FetchDeviceKeys(request)
    }
}

/// The server's acknowledgement of a one-time key upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishOneTimeKeysResponse {
    /// How many unclaimed one-time keys the server now holds for us.
    pub one_time_key_count: usize,
}

/// The result of claiming a one-time key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimOneTimeKeyResponse {
    /// The claimed key, or `None` if the device's supply is exhausted.
    pub one_time_key: Option<SignedOneTimeKey>,
}

/// The published device key bundles of a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchDeviceKeysResponse {
    /// One self-signed bundle per device of the user.
    pub device_keys: Vec<PublishedDeviceKeys>,
}

/// Enum over the responses a transport hands back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IncomingResponse {
    /// The acknowledgement of a one-time key upload.
    PublishOneTimeKeys(PublishOneTimeKeysResponse),
    /// The result of a one-time key claim.
    ClaimOneTimeKey(ClaimOneTimeKeyResponse),
    /// The device key bundles of a user.
    FetchDeviceKeys(FetchDeviceKeysResponse),
}

impl From<PublishOneTimeKeysResponse> for IncomingResponse {
    fn from(response: PublishOneTimeKeysResponse) -> Self {
        Self::PublishOneTimeKeys(response)
    }
}

impl From<ClaimOneTimeKeyResponse> for IncomingResponse {
    fn from(response: ClaimOneTimeKeyResponse) -> Self {
        Self::ClaimOneTimeKey(response)
    }
}

impl From<FetchDeviceKeysResponse> for IncomingResponse {
    fn from(response: FetchDeviceKeysResponse) -> Self {
        Self::FetchDeviceKeys(response)
    }
}

impl IncomingResponse {
    pub(crate) fn into_publish(self) -> Result<PublishOneTimeKeysResponse, TransportError> {
        match self {
            IncomingResponse::PublishOneTimeKeys(response) => Ok(response),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub(crate) fn into_claim(self) -> Result<ClaimOneTimeKeyResponse, TransportError> {
        match self {
            IncomingResponse::ClaimOneTimeKey(response) => Ok(response),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub(crate) fn into_device_keys(self) -> Result<FetchDeviceKeysResponse, TransportError> {
        match self {
            IncomingResponse::FetchDeviceKeys(response) => Ok(response),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
}

/// The collaborator that carries requests to the key server.
///
/// Implementations decide how requests reach the server and whether network
/// failures are retried; see [`RetryingTransport`] for a generic retry
/// wrapper.
///
/// [`RetryingTransport`]: crate::RetryingTransport
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Carry out the given request, returning the server's response.
    async fn send(&self, request: OutgoingRequest) -> Result<IncomingResponse, TransportError>;
}

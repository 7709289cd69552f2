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

use thiserror::Error;

use crate::{
    store::StoreError,
    types::{DeviceId, KeyError, OneTimeKeyId, SessionId, UserId},
};

/// Type alias for the result of operations on the [`SessionManager`].
///
/// [`SessionManager`]: crate::SessionManager
pub type SessionResult<T> = Result<T, SessionError>;

/// Error representing a failure of a device to device encryption operation.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The storage layer returned an error. The in-flight message is lost
    /// and, if the failure happened during an encrypt operation, the session
    /// may need to be re-established before further use.
    #[error("failed to read or write to the key store: {0}")]
    Store(#[from] StoreError),

    /// The per-session ratchet refused the operation.
    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    /// Establishing a new session with a remote device failed.
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),

    /// A message arrived for a session we don't have. Only the sender can
    /// initiate the missing ratchet, so this is surfaced to the caller for a
    /// key re-exchange rather than auto-established.
    #[error("no session with id {session_id} exists for device {device_id} of user {user_id}")]
    UnknownSession {
        /// The user the message came from.
        user_id: UserId,
        /// The device the message came from.
        device_id: DeviceId,
        /// The session id the message was encrypted with.
        session_id: SessionId,
    },

    /// We were asked to encrypt for a device whose keys we have never seen.
    #[error("the device {1} of user {0} is not known")]
    UnknownDevice(UserId, DeviceId),

    /// We were asked to encrypt for a device that the user explicitly
    /// blocked.
    #[error("the device {1} of user {0} has been blocked")]
    BlockedDevice(UserId, DeviceId),
}

/// Error representing a cryptographic-state failure of a session ratchet.
///
/// None of these errors are retryable; they are surfaced to the caller for
/// user-visible "unable to decrypt" handling.
#[derive(Error, Debug)]
pub enum RatchetError {
    /// The message index lies before the next expected receive index and its
    /// message key is not cached, either because it was already consumed or
    /// because the skipped-key cache dropped it.
    #[error(
        "the message with index {index} was already decrypted or its key has \
         been irrecoverably dropped"
    )]
    ReplayOrDesync {
        /// The index of the undecryptable message.
        index: u64,
    },

    /// Decrypting the message would require deriving more skipped message
    /// keys than the configured bound allows.
    #[error("decrypting the message would skip {requested} message keys, the bound is {bound}")]
    TooManySkippedMessages {
        /// How many keys would have to be skipped.
        requested: u64,
        /// The configured bound.
        bound: u64,
    },

    /// The session reached its configured message cap and needs to be
    /// re-established before further messages can be encrypted.
    #[error("the session is exhausted after {0} sent messages")]
    SessionExhausted(u64),

    /// The ciphertext failed authentication.
    #[error("the ciphertext failed to be authenticated and decrypted")]
    Decryption,
}

/// Error representing a failure while establishing a new session with a
/// remote device.
#[derive(Error, Debug)]
pub enum KeyExchangeError {
    /// The published one-time key bundle of the remote device is exhausted.
    /// This is reported upward for an out-of-band key refresh and must never
    /// be retried in a tight loop.
    #[error("the device {1} of user {0} has no one-time keys available")]
    NoOneTimeKeysAvailable(UserId, DeviceId),

    /// The signature over published key material didn't verify against the
    /// device's identity key.
    #[error("the signature of the published key material couldn't be verified: {0}")]
    InvalidSignature(#[from] KeyError),

    /// An inbound pre-key message referenced a one-time key we no longer
    /// hold, most likely because it was already consumed.
    #[error("the pre-key message references the unknown one-time key {0}")]
    UnknownOneTimeKey(OneTimeKeyId),

    /// The identity key in a pre-key message didn't match the keys the
    /// device registry has on record for the sending device.
    #[error("the pre-key message identity key doesn't match the known keys of device {1} of {0}")]
    MismatchedIdentityKeys(UserId, DeviceId),

    /// The first message of an inbound session failed to decrypt.
    #[error("the pre-key message payload couldn't be decrypted: {0}")]
    InitialMessage(#[from] RatchetError),

    /// The transport collaborator failed to carry out a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by the transport collaborator.
///
/// The core treats transport calls as potentially slow, fallible operations;
/// whether and how a network failure is retried is the transport layer's
/// decision (see [`RetryingTransport`]).
///
/// [`RetryingTransport`]: crate::RetryingTransport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request failed on the network level and may be retried by the
    /// transport layer.
    #[error("the request failed on the network level: {0}")]
    Network(String),

    /// The server rejected the request; retrying won't help.
    #[error("the server rejected the request: {0}")]
    Rejected(String),

    /// The transport answered with a response type that doesn't match the
    /// request.
    #[error("the transport answered with a mismatched response type")]
    UnexpectedResponse,
}

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

#![doc = include_str!("../README.md")]
#![deny(
    missing_debug_implementations,
    dead_code,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

mod error;
mod identities;
mod machine;
pub mod ratchet;
mod requests;
mod session_manager;
pub mod store;
mod transport;
pub mod types;
mod utilities;

pub use error::{
    KeyExchangeError, RatchetError, SessionError, SessionResult, TransportError,
};
pub use identities::{DeviceIdentity, DeviceRegistry, TrustState};
pub use machine::SessionManager;
pub use ratchet::{Message, PreKeyMessage, RatchetMessage, Session, SessionConfig, SessionStage};
pub use requests::{
    ClaimOneTimeKeyRequest, ClaimOneTimeKeyResponse, FetchDeviceKeysRequest,
    FetchDeviceKeysResponse, IncomingResponse, OutgoingRequest, PublishOneTimeKeysRequest,
    PublishOneTimeKeysResponse, PublishedDeviceKeys, Transport,
};
pub use transport::{RetryConfig, RetryingTransport};

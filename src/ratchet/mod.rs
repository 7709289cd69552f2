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

//! The cryptographic core: the local account and the per-session message
//! ratchet.
//!
//! An [`Account`] holds the device's long-term keys and creates [`Session`]s
//! through a triple Diffie-Hellman establishment; a session then derives one
//! single-use message key per message from an HMAC-SHA256 hash chain.

mod account;
mod chain;
mod messages;
mod session;

pub use account::{Account, IdentityKeys, InboundCreationResult, PickledAccount};
pub use messages::{Message, PreKeyMessage, RatchetMessage};
pub use session::{
    EstablishmentInfo, PickledSession, Session, SessionConfig, SessionStage,
};

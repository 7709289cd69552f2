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

//! Small in-memory caches holding the live state the store backs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    ratchet::{Session, SessionConfig},
    store::{Store, StoreError},
    types::{DeviceId, UserId},
};

/// In-memory cache of the sessions shared with remote devices, keyed by the
/// device pair.
///
/// The cache is the authoritative in-memory copy: the ratchet state inside
/// it is only ever replaced after the matching store transaction committed.
#[derive(Clone, Debug, Default)]
pub(crate) struct SessionCache {
    entries: Arc<DashMap<(UserId, DeviceId), Arc<Mutex<Vec<Session>>>>>,
}

impl SessionCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Get the session list shared with the given device, creating an empty
    /// one if the pair was never seen.
    pub(crate) fn get_or_create(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Arc<Mutex<Vec<Session>>> {
        self.entries
            .entry((user_id.clone(), device_id.clone()))
            .or_default()
            .clone()
    }

    /// Get the session list shared with the given device, filling an empty
    /// slot from the store first.
    pub(crate) async fn get_or_load(
        &self,
        store: &Store,
        config: SessionConfig,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Arc<Mutex<Vec<Session>>>, StoreError> {
        let slot = self.get_or_create(user_id, device_id);

        {
            let mut sessions = slot.lock().await;

            if sessions.is_empty() {
                *sessions = store
                    .get_sessions(user_id, device_id)
                    .await?
                    .into_iter()
                    .map(|pickle| Session::from_pickle(pickle, config))
                    .collect::<Result<_, _>>()?;
            }
        }

        Ok(slot)
    }
}

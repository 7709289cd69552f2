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

//! Keyed async locks enforcing the per-device-pair mutual exclusion that
//! session establishment requires.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of named async locks.
///
/// Operations on distinct keys proceed independently and in parallel;
/// exactly one holder exists per key at any time. Locks are never removed
/// from the map, the number of keys is bounded by the number of sessions and
/// device pairs.
#[derive(Clone, Debug, Default)]
pub(crate) struct LockMap {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for the given key, waiting until it is free.
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_owned()).or_default().clone();

        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::LockMap;

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = LockMap::new();

        let first = locks.lock("first").await;
        // Holding "first" must not block "second".
        let _second = locks.lock("second").await;

        drop(first);
        let _first_again = locks.lock("first").await;
    }

    #[tokio::test]
    async fn same_key_is_mutually_exclusive() {
        let locks = Arc::new(LockMap::new());

        let guard = locks.lock("session").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("session").await;
            })
        };

        // The contender can't finish while we hold the lock.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}

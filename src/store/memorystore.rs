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

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use super::{KeyStore, Result, StoreOp};

/// An in-memory [`KeyStore`] implementation.
///
/// The whole map sits behind a single lock, which is what makes a
/// transaction batch atomic. This is the default store of the
/// [`SessionManager`] and the store used by the test-suite; nothing is
/// persisted across restarts.
///
/// [`SessionManager`]: crate::SessionManager
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<u8>>> {
        // A poisoned lock means a writer panicked mid-mutation; the data is
        // gone either way for an in-memory store.
        self.entries.write().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(|poison| poison.into_inner());

        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write().insert(key.to_owned(), value);

        Ok(())
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut entries = self.write();

        for op in ops {
            match op {
                StoreOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                StoreOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn get_put_roundtrip() {
        let store = MemoryStore::new();

        assert!(store.get("key").await.unwrap().is_none());

        store.put("key", b"value".to_vec()).await.unwrap();
        assert_eq!(store.get("key").await.unwrap().unwrap(), b"value");
    }

    #[tokio::test]
    async fn transactions_apply_every_op() {
        let store = MemoryStore::new();
        store.put("stale", b"old".to_vec()).await.unwrap();

        store
            .transaction(vec![
                StoreOp::Put { key: "first".to_owned(), value: b"1".to_vec() },
                StoreOp::Put { key: "second".to_owned(), value: b"2".to_vec() },
                StoreOp::Delete { key: "stale".to_owned() },
            ])
            .await
            .unwrap();

        assert_eq!(store.get("first").await.unwrap().unwrap(), b"1");
        assert_eq!(store.get("second").await.unwrap().unwrap(), b"2");
        assert!(store.get("stale").await.unwrap().is_none());
    }
}

//! The replicated application and the reference key-value store.

use palisade_types::Digest;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State the executor applies committed requests to.
///
/// Implementations must be deterministic: replicas that apply the same
/// writes in the same order report the same [`Application::state_digest`].
pub trait Application: Send + Sync {
    fn read(&self, key: &str) -> Option<Vec<u8>>;

    fn write(&mut self, key: &str, value: Vec<u8>);

    /// Digest over the entire state, used for checkpoint agreement.
    fn state_digest(&self) -> Digest;
}

/// In-memory ordered key-value store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store with every `(key, balance)` pair preloaded as a transfer account.
    pub fn with_balances<'a>(accounts: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        let mut store = Self::new();
        for (key, balance) in accounts {
            store.write(key, balance.to_le_bytes().to_vec());
        }
        store
    }
}

impl Application for KvStore {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn write(&mut self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value);
    }

    fn state_digest(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.entries.len() as u64).to_le_bytes());
        for (key, value) in &self.entries {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
        Digest::from_raw(*hasher.finalize().as_bytes())
    }
}

/// Application handle shared by the executor and the speculating primary.
///
/// The executor takes the write lock once per batch; speculation reads a
/// consistent snapshot under the read lock.
#[derive(Clone)]
pub struct SharedApplication {
    inner: Arc<RwLock<Box<dyn Application>>>,
}

impl std::fmt::Debug for SharedApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedApplication").finish_non_exhaustive()
    }
}

impl SharedApplication {
    pub fn new(application: impl Application + 'static) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Box::new(application))),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<dyn Application>> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<dyn Application>> {
        self.inner.write()
    }

    pub fn state_digest(&self) -> Digest {
        self.inner.read().state_digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_depends_on_contents_not_history() {
        let mut a = KvStore::new();
        a.write("x", vec![1]);
        a.write("y", vec![2]);

        let mut b = KvStore::new();
        b.write("y", vec![9]);
        b.write("x", vec![1]);
        assert_ne!(a.state_digest(), b.state_digest());

        b.write("y", vec![2]);
        assert_eq!(a.state_digest(), b.state_digest());
    }

    #[test]
    fn test_digest_separates_keys_from_values() {
        let mut a = KvStore::new();
        a.write("ab", b"c".to_vec());
        let mut b = KvStore::new();
        b.write("a", b"bc".to_vec());
        assert_ne!(a.state_digest(), b.state_digest());
    }

    #[test]
    fn test_shared_handle_sees_writes() {
        let shared = SharedApplication::new(KvStore::new());
        let reader = shared.clone();
        shared.write().write("k", vec![7]);
        assert_eq!(reader.read().read("k"), Some(vec![7]));
    }
}

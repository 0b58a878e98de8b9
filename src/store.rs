use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// The shared key-value table. Keys and values are arbitrary bytes. Writers hold the exclusive side of [`Store`]'s
/// lock for the whole mutation, so readers only ever see completed writes.
#[derive(Default)]
pub(crate) struct Db {
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl Db {
    pub(crate) fn new() -> Self {
        Self::from_entries(HashMap::new())
    }

    pub(crate) fn from_entries(entries: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        let db = Self { entries };
        db.record_len();
        db
    }

    fn record_len(&self) {
        metrics::gauge!("snapkv_keys_total").set(self.entries.len() as f64);
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.keys().map(Vec::as_slice)
    }

    pub(crate) fn entries(&self) -> &HashMap<Vec<u8>, Vec<u8>> {
        &self.entries
    }

    pub(crate) fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
        self.record_len();
    }

    /// Returns how many of `keys` were present. Duplicates count once.
    pub(crate) fn remove_all<'a>(&mut self, keys: impl IntoIterator<Item = &'a [u8]>) -> usize {
        let removed = keys
            .into_iter()
            .filter(|k| self.entries.remove(*k).is_some())
            .count();
        if removed > 0 {
            self.record_len();
        }
        removed
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.record_len();
    }

    /// Point-in-time copy used as a background snapshot's frozen view.
    pub(crate) fn freeze(&self) -> Arc<HashMap<Vec<u8>, Vec<u8>>> {
        Arc::new(self.entries.clone())
    }
}

pub(crate) type Store = Arc<RwLock<Db>>;

pub(crate) fn new_store(db: Db) -> Store {
    Arc::new(RwLock::new(db))
}

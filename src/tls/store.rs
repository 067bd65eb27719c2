//! Shared snapshot cell for the active ticket key set.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::tls::key::TicketKeySet;

/// Holds the active key set as one immutable snapshot.
///
/// Readers never lock and always see a complete set; writers replace the
/// whole `Arc`. `None` means ticket encryption is unavailable.
#[derive(Debug, Clone, Default)]
pub struct TicketKeyStore {
    inner: Arc<ArcSwapOption<TicketKeySet>>,
}

impl TicketKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: Option<Arc<TicketKeySet>>) -> Self {
        Self {
            inner: Arc::new(ArcSwapOption::new(keys)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Option<Arc<TicketKeySet>> {
        self.inner.load_full()
    }

    /// Replace the snapshot.
    pub fn store(&self, keys: Option<Arc<TicketKeySet>>) {
        self.inner.store(keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::key::{TicketCipher, TicketKey};

    fn set_named(byte: u8) -> Arc<TicketKeySet> {
        let key = TicketKey::from_parts(TicketCipher::Aes128Cbc, [byte; 16], &[0; 16], &[0; 16]).unwrap();
        Arc::new(TicketKeySet::new(vec![Arc::new(key)]))
    }

    #[test]
    fn readers_keep_superseded_snapshot() {
        let store = TicketKeyStore::new();
        assert!(store.load().is_none());

        store.store(Some(set_named(1)));
        let held = store.load().unwrap();

        store.store(Some(set_named(2)));
        assert_eq!(held.encryption_key().unwrap().name(), &[1; 16]);
        assert_eq!(store.load().unwrap().encryption_key().unwrap().name(), &[2; 16]);
    }

    #[test]
    fn clones_share_one_cell() {
        let store = TicketKeyStore::new();
        let reader = store.clone();
        store.store(Some(set_named(3)));
        assert!(reader.load().is_some());
        store.store(None);
        assert!(reader.load().is_none());
    }
}

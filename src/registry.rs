//! Key-to-signer association.
//!
//! Every delegated key gets a process-unique [`KeyId`] and a slot in the
//! engine's [`KeyRegistry`] holding its signer handle. The slot is written
//! when the key is materialized, read from handshake threads for every
//! signature, and removed when the last clone of the key is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::signer::ExternalSigner;

/// Identity of one delegated key, allocated at materialization time and never
/// reused for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(u64);

impl KeyId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Associates delegated-key identities with signer handles.
///
/// The registry stores each handle opaquely (an `Arc` clone, nothing more).
/// A slot is written once, when the key is materialized, read from handshake
/// threads thereafter, and detached when the key's registration is released.
#[derive(Debug, Default)]
pub(crate) struct KeyRegistry {
    slots: RwLock<HashMap<KeyId, Arc<dyn ExternalSigner>>>,
}

impl KeyRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Associate `signer` with `id`. Must happen strictly before the key is
    /// shared with any TLS configuration.
    pub(crate) fn attach(&self, id: KeyId, signer: Arc<dyn ExternalSigner>) {
        let mut slots = self.slots.write().expect("key registry lock poisoned");
        slots.insert(id, signer);
    }

    /// Look up the signer for `id`. `None` means no signer was ever attached;
    /// callers must treat that as a hard failure, never as "sign locally".
    pub(crate) fn resolve(&self, id: KeyId) -> Option<Arc<dyn ExternalSigner>> {
        let slots = self.slots.read().expect("key registry lock poisoned");
        slots.get(&id).cloned()
    }

    /// Release the slot for `id`, dropping the registry's handle clone. Ids
    /// are never reused, so a detached slot stays unresolvable forever.
    pub(crate) fn detach(&self, id: KeyId) {
        let mut slots = self.slots.write().expect("key registry lock poisoned");
        slots.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::CallbackSigner;

    #[test]
    fn resolve_returns_attached_signer() {
        let registry = KeyRegistry::new();
        let id = KeyId::next();
        registry.attach(id, Arc::new(CallbackSigner::new(8, |_: &[u8]| Ok(vec![1]))));

        let signer = registry.resolve(id).expect("signer attached");
        assert_eq!(signer.signature_len(b"m").unwrap(), 8);
    }

    #[test]
    fn resolve_unattached_is_none() {
        let registry = KeyRegistry::new();
        assert!(registry.resolve(KeyId::next()).is_none());
    }

    #[test]
    fn detach_releases_the_slot() {
        let registry = KeyRegistry::new();
        let id = KeyId::next();
        registry.attach(id, Arc::new(CallbackSigner::new(8, |_: &[u8]| Ok(vec![1]))));
        assert!(registry.resolve(id).is_some());

        registry.detach(id);
        assert!(registry.resolve(id).is_none());
    }

    #[test]
    fn key_ids_are_unique() {
        let a = KeyId::next();
        let b = KeyId::next();
        assert_ne!(a, b);
    }
}

//! The signing engine and its one-time process-wide initialization.
//!
//! The engine bundles one delegating method table per supported algorithm
//! with the registry that maps keys to signer handles. [`SigningEngine::global`]
//! hands out the shared process instance; construction is guarded so racing
//! first callers build it exactly once and a failed build can be retried.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;

use crate::error::OffloadError;
use crate::key::KeyAlgorithm;
use crate::method::SignMethod;
use crate::registry::KeyRegistry;

/// The provider that supplies delegating method tables for supported
/// algorithms, together with the registry mapping keys to signer handles.
///
/// One engine normally exists per process (see [`SigningEngine::global`]) and
/// lives for its remainder; its tables are built once and never mutated.
/// Tests construct private instances with [`SigningEngine::new`] instead of
/// sharing the process-wide one.
pub struct SigningEngine {
    rsa: SignMethod,
    ec: SignMethod,
    registry: KeyRegistry,
}

impl std::fmt::Debug for SigningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningEngine").finish_non_exhaustive()
    }
}

impl SigningEngine {
    /// Build a fresh engine: one delegating method table per supported
    /// algorithm. Fails atomically; no partially built engine is retained.
    pub fn new() -> Result<Arc<Self>, OffloadError> {
        debug!("building delegated signing engine");
        let rsa = SignMethod::delegated(KeyAlgorithm::Rsa)?;
        let ec = SignMethod::delegated(KeyAlgorithm::Ec)?;
        Ok(Arc::new(Self {
            rsa,
            ec,
            registry: KeyRegistry::new(),
        }))
    }

    /// The process-wide engine, built on first use.
    ///
    /// Initialization is guarded so concurrent first callers construct the
    /// engine exactly once, and a failed construction leaves the slot empty
    /// so a later call retries from scratch.
    pub fn global() -> Result<Arc<Self>, OffloadError> {
        static GLOBAL: EngineSlot = EngineSlot::new();
        GLOBAL.get_or_init()
    }

    /// The algorithms this engine supplies method tables for.
    pub fn supported_algorithms(&self) -> &'static [KeyAlgorithm] {
        &[KeyAlgorithm::Rsa, KeyAlgorithm::Ec]
    }

    pub(crate) fn lookup_method(&self, algorithm: KeyAlgorithm) -> Option<&SignMethod> {
        match algorithm {
            KeyAlgorithm::Rsa => Some(&self.rsa),
            KeyAlgorithm::Ec => Some(&self.ec),
        }
    }

    pub(crate) fn registry(&self) -> &KeyRegistry {
        &self.registry
    }
}

/// One-time initialization slot with double-checked locking.
///
/// The fast path is a lock-free read of the cell; first-time construction
/// serializes on the mutex, and only a successful build is published. An
/// initialization that failed is indistinguishable from one that never ran.
struct EngineSlot {
    cell: OnceLock<Arc<SigningEngine>>,
    init: Mutex<()>,
    builds: AtomicUsize,
}

impl EngineSlot {
    const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(()),
            builds: AtomicUsize::new(0),
        }
    }

    fn get_or_init(&self) -> Result<Arc<SigningEngine>, OffloadError> {
        self.get_or_init_with(SigningEngine::new)
    }

    fn get_or_init_with(
        &self,
        build: impl FnOnce() -> Result<Arc<SigningEngine>, OffloadError>,
    ) -> Result<Arc<SigningEngine>, OffloadError> {
        if let Some(engine) = self.cell.get() {
            return Ok(Arc::clone(engine));
        }
        let _guard = self.init.lock().expect("engine init lock poisoned");
        // Another thread may have won the race while we waited on the lock.
        if let Some(engine) = self.cell.get() {
            return Ok(Arc::clone(engine));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let engine = build()?;
        Ok(Arc::clone(self.cell.get_or_init(|| engine)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;

    #[test]
    fn lookup_supplies_one_table_per_algorithm() {
        let engine = SigningEngine::new().unwrap();
        assert_eq!(
            engine.lookup_method(KeyAlgorithm::Rsa).unwrap().algorithm,
            KeyAlgorithm::Rsa
        );
        assert_eq!(
            engine.lookup_method(KeyAlgorithm::Ec).unwrap().algorithm,
            KeyAlgorithm::Ec
        );
        assert_eq!(
            engine.supported_algorithms(),
            &[KeyAlgorithm::Rsa, KeyAlgorithm::Ec]
        );
    }

    #[test]
    fn slot_builds_exactly_once() {
        let slot = EngineSlot::new();
        let first = slot.get_or_init().unwrap();
        let second = slot.get_or_init().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(slot.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_build_is_retried_cleanly() {
        let slot = EngineSlot::new();

        let failed = slot.get_or_init_with(|| {
            Err(OffloadError::MethodTable { algorithm: "test" })
        });
        assert!(failed.is_err());

        // The slot looks uninitialized again; the next call builds for real.
        let engine = slot.get_or_init().unwrap();
        assert!(Arc::ptr_eq(&engine, &slot.get_or_init().unwrap()));
        assert_eq!(slot.builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_use_builds_exactly_once() {
        let slot = Arc::new(EngineSlot::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || slot.get_or_init().unwrap())
            })
            .collect();

        let engines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(slot.builds.load(Ordering::SeqCst), 1);
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
    }

    #[test]
    fn global_is_stable_across_calls() {
        let first = SigningEngine::global().unwrap();
        let second = SigningEngine::global().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}

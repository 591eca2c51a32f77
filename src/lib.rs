//! Delegate rustls private-key signing to an external signer.
//!
//! A TLS endpoint normally holds its private key in memory. When the key
//! lives in an HSM, a remote KMS, or an OS credential store instead, only a
//! signing callback is available. This crate builds a key object from a
//! certificate (public key only) and such a callback, and wires it into a
//! rustls configuration so that every handshake signature is produced by the
//! external signer while certificate handling, key exchange, and the record
//! layer stay untouched.
//!
//! Implement [`ExternalSigner`] for the backend (or wrap a plain function
//! with [`CallbackSigner`]), then let [`OffloadInstaller`] do the rest:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tls_offload::{CallbackSigner, OffloadInstaller, SignError};
//!
//! # fn main() -> Result<(), tls_offload::OffloadError> {
//! // A 2048-bit RSA credential held by an external keystore.
//! let signer = Arc::new(CallbackSigner::new(256, |message: &[u8]| {
//!     external_keystore_sign(message).map_err(|e| SignError::External(e.to_string()))
//! }));
//!
//! let installer = OffloadInstaller::new()?;
//! let config = installer.server_config(signer, CERT_PEM)?;
//! # Ok(())
//! # }
//! # const CERT_PEM: &str = "";
//! # fn external_keystore_sign(_m: &[u8]) -> Result<Vec<u8>, std::io::Error> { unimplemented!() }
//! ```
//!
//! The signer may block (a slow network KMS is fine) and is called on
//! whatever threads the embedding application runs its handshakes on.

mod config;
mod engine;
mod error;
mod key;
mod method;
mod registry;
mod signer;

pub use config::OffloadInstaller;
pub use engine::SigningEngine;
pub use error::{OffloadError, SignError};
pub use key::{DelegatedKey, KeyAlgorithm, KeyMaterializer};
pub use signer::{CallbackSigner, ExternalSigner};

//! Error taxonomy: setup failures ([`OffloadError`]) and per-signature
//! failures ([`SignError`]), the latter convertible into [`rustls::Error`]
//! so a failed delegation aborts only the handshake that requested it.

use rustls::SignatureScheme;
use spki::ObjectIdentifier;
use thiserror::Error;

/// Failure of an installation or materialization attempt.
///
/// Initialization errors ([`OffloadError::MethodTable`]) mean the process-wide
/// engine could not be built; a later attempt retries from a clean state.
/// Everything else is scoped to the single certificate/signer pair passed in.
#[derive(Debug, Error)]
pub enum OffloadError {
    /// The PEM input contained no certificate.
    #[error("certificate PEM contained no certificates")]
    EmptyCertChain,

    /// The PEM input could not be decoded.
    #[error("invalid certificate PEM: {0}")]
    InvalidPem(#[from] pki_types::pem::Error),

    /// The leaf certificate is not a valid X.509 structure, or its
    /// subject-public-key-info could not be serialized or re-parsed.
    #[error("malformed certificate: {0}")]
    MalformedCertificate(#[from] der::Error),

    /// The embedded public key is structurally valid but unusable.
    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    /// The certificate's key algorithm is neither RSA nor EC.
    #[error("unsupported public key algorithm {oid}")]
    UnsupportedAlgorithm { oid: ObjectIdentifier },

    /// The EC key uses a curve with no assigned TLS signature scheme.
    #[error("unsupported elliptic curve {oid}")]
    UnsupportedCurve { oid: ObjectIdentifier },

    /// A per-algorithm method table could not be constructed.
    #[error("no default method table for {algorithm}")]
    MethodTable { algorithm: &'static str },

    /// rustls rejected the resulting configuration.
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Failure of a single delegated sign operation.
///
/// These surface to the TLS library as a signature failure, which aborts the
/// handshake in progress; other handshakes sharing the engine are unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignError {
    /// No signer handle is associated with the key. Delegation never falls
    /// back to local signing.
    #[error("no signer is associated with this key")]
    MissingSigner,

    /// The key wraps public material only and the method table has no
    /// delegating sign entry.
    #[error("key holds no private material")]
    NoPrivateMaterial,

    /// The negotiated scheme does not match the key's algorithm.
    #[error("signature scheme {0:?} is not supported by this key")]
    UnsupportedScheme(SignatureScheme),

    /// The caller-supplied output buffer cannot hold the signature.
    #[error("signature buffer too small: need {needed}, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// The external signer reported failure.
    #[error("external signer failed: {0}")]
    External(String),
}

impl From<SignError> for rustls::Error {
    fn from(err: SignError) -> Self {
        rustls::Error::General(err.to_string())
    }
}

//! Delegated key construction.
//!
//! [`KeyMaterializer`] turns a certificate plus a signer handle into a
//! [`DelegatedKey`]: a key object the TLS stack treats like any private key,
//! except that signature requests are routed through the engine's method
//! table to the external signer. Only the certificate's public half is ever
//! parsed; no private material exists on this side.

use std::sync::Arc;

use der::{Decode, Encode};
use log::debug;
use pki_types::{CertificateDer, SubjectPublicKeyInfoDer};
use rustls::sign::Signer;
use rustls::{SignatureAlgorithm, SignatureScheme};
use spki::ObjectIdentifier;

use crate::engine::SigningEngine;
use crate::error::OffloadError;
use crate::method::{CtrlQuery, SignOp};
use crate::registry::KeyId;
use crate::signer::ExternalSigner;

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// Key algorithms the engine supplies method tables for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
}

impl KeyAlgorithm {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EcCurve {
    P256,
    P384,
}

/// The public half of a delegated key, parsed out of a certificate's
/// subject-public-key-info.
#[derive(Debug, Clone)]
pub(crate) enum PublicKey {
    Rsa {
        /// Modulus size in bytes; also the exact RSA signature size.
        modulus_len: usize,
        spki: Vec<u8>,
    },
    Ec {
        curve: EcCurve,
        spki: Vec<u8>,
    },
}

impl PublicKey {
    /// Parse an owned SPKI. Only RSA and EC keys on curves with an assigned
    /// TLS 1.3 signature scheme are representable.
    pub(crate) fn from_spki_der(spki_der: &[u8]) -> Result<Self, OffloadError> {
        let info = spki::SubjectPublicKeyInfoRef::from_der(spki_der)?;
        let oid = info.algorithm.oid;
        if oid == RSA_ENCRYPTION {
            use rsa::pkcs8::DecodePublicKey;
            use rsa::traits::PublicKeyParts;
            let key = rsa::RsaPublicKey::from_public_key_der(spki_der)
                .map_err(|e| OffloadError::MalformedPublicKey(e.to_string()))?;
            Ok(Self::Rsa {
                modulus_len: key.size(),
                spki: spki_der.to_vec(),
            })
        } else if oid == ID_EC_PUBLIC_KEY {
            let params = info
                .algorithm
                .parameters_oid()
                .map_err(|e| OffloadError::MalformedPublicKey(e.to_string()))?;
            let curve = if params == SECP256R1 {
                EcCurve::P256
            } else if params == SECP384R1 {
                EcCurve::P384
            } else {
                return Err(OffloadError::UnsupportedCurve { oid: params });
            };
            Ok(Self::Ec {
                curve,
                spki: spki_der.to_vec(),
            })
        } else {
            Err(OffloadError::UnsupportedAlgorithm { oid })
        }
    }

    pub(crate) fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Rsa { .. } => KeyAlgorithm::Rsa,
            Self::Ec { .. } => KeyAlgorithm::Ec,
        }
    }

    pub(crate) fn bits(&self) -> usize {
        match self {
            Self::Rsa { modulus_len, .. } => modulus_len * 8,
            Self::Ec { curve: EcCurve::P256, .. } => 256,
            Self::Ec { curve: EcCurve::P384, .. } => 384,
        }
    }

    /// Upper bound on signature size: exact for RSA, the maximal DER
    /// encoding of (r, s) for ECDSA.
    pub(crate) fn max_signature_len(&self) -> usize {
        match self {
            Self::Rsa { modulus_len, .. } => *modulus_len,
            Self::Ec { curve, .. } => {
                let coord = match curve {
                    EcCurve::P256 => 32,
                    EcCurve::P384 => 48,
                };
                2 + 2 * (coord + 3)
            }
        }
    }

    /// The signature schemes this key can serve. TLS 1.3 pins RSA to PSS and
    /// each EC curve to one hash, so every key offers exactly one scheme and
    /// the external signer never has to guess the format.
    pub(crate) fn schemes(&self) -> &'static [SignatureScheme] {
        match self {
            Self::Rsa { .. } => &[SignatureScheme::RSA_PSS_SHA256],
            Self::Ec { curve: EcCurve::P256, .. } => &[SignatureScheme::ECDSA_NISTP256_SHA256],
            Self::Ec { curve: EcCurve::P384, .. } => &[SignatureScheme::ECDSA_NISTP384_SHA384],
        }
    }

    pub(crate) fn spki(&self) -> &[u8] {
        match self {
            Self::Rsa { spki, .. } | Self::Ec { spki, .. } => spki,
        }
    }
}

/// Ties the registry slot to the key's lifetime: every clone of a
/// [`DelegatedKey`] (including the per-handshake signers it spawns) shares
/// one registration, and dropping the last clone detaches the slot so the
/// signer handle is released with the key.
#[derive(Debug)]
struct KeyRegistration {
    id: KeyId,
    engine: Arc<SigningEngine>,
}

impl Drop for KeyRegistration {
    fn drop(&mut self) {
        self.engine.registry().detach(self.id);
    }
}

/// A key object whose sign operations are redirected to an external signer.
///
/// Holds the certificate's public key, the engine whose method table serves
/// it, and the identity under which its signer handle is registered.
#[derive(Debug, Clone)]
pub struct DelegatedKey {
    public_key: PublicKey,
    registration: Arc<KeyRegistration>,
}

impl DelegatedKey {
    pub(crate) fn new(id: KeyId, public_key: PublicKey, engine: Arc<SigningEngine>) -> Self {
        Self {
            public_key,
            registration: Arc::new(KeyRegistration { id, engine }),
        }
    }

    pub(crate) fn id(&self) -> KeyId {
        self.registration.id
    }

    pub(crate) fn engine(&self) -> &SigningEngine {
        &self.registration.engine
    }

    pub(crate) fn public_key_info(&self) -> &PublicKey {
        &self.public_key
    }

    pub(crate) fn supports_scheme(&self, scheme: SignatureScheme) -> bool {
        self.public_key.schemes().contains(&scheme)
    }
}

impl rustls::sign::SigningKey for DelegatedKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = self
            .public_key
            .schemes()
            .iter()
            .copied()
            .find(|scheme| offered.contains(scheme))?;
        Some(Box::new(DelegatedSigner {
            key: self.clone(),
            scheme,
        }))
    }

    fn public_key(&self) -> Option<SubjectPublicKeyInfoDer<'_>> {
        Some(SubjectPublicKeyInfoDer::from(self.public_key.spki()))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        match self.public_key.algorithm() {
            KeyAlgorithm::Rsa => SignatureAlgorithm::RSA,
            KeyAlgorithm::Ec => SignatureAlgorithm::ECDSA,
        }
    }
}

/// One negotiated signing operation, driving the method table's entries in
/// the order the underlying convention prescribes: init, length query,
/// signature, cleanup.
#[derive(Debug)]
struct DelegatedSigner {
    key: DelegatedKey,
    scheme: SignatureScheme,
}

impl Signer for DelegatedSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        let method = self
            .key
            .engine()
            .lookup_method(self.key.public_key.algorithm())
            .ok_or_else(|| rustls::Error::General("no method table for key algorithm".into()))?;

        let mut op = SignOp {
            key: &self.key,
            scheme: self.scheme,
        };
        (method.init)(&op).map_err(rustls::Error::from)?;

        let needed = if method.flags.variable_len_output {
            let mut needed = 0;
            (method.sign)(&op, None, &mut needed, message).map_err(rustls::Error::from)?;
            needed
        } else {
            (method.ctrl)(&op, CtrlQuery::MaxSignatureLen)
        };

        let mut signature = vec![0u8; needed];
        let mut written = needed;
        (method.sign)(&op, Some(&mut signature), &mut written, message)
            .map_err(rustls::Error::from)?;
        (method.cleanup)(&mut op);

        signature.truncate(written);
        Ok(signature)
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

/// Builds delegated keys against one engine.
pub struct KeyMaterializer {
    engine: Arc<SigningEngine>,
}

impl KeyMaterializer {
    pub fn new(engine: Arc<SigningEngine>) -> Self {
        Self { engine }
    }

    /// Extract the certificate's public key, bind it to the engine, and
    /// register `signer` for it.
    ///
    /// Pure in-memory transformation. On error nothing is retained: the
    /// registry slot is only written once every fallible step has succeeded,
    /// and always before the returned key can reach a TLS configuration.
    pub fn materialize(
        &self,
        signer: Arc<dyn ExternalSigner>,
        cert: &CertificateDer<'_>,
    ) -> Result<Arc<DelegatedKey>, OffloadError> {
        let parsed = x509_cert::Certificate::from_der(cert.as_ref())?;
        // Round-trip the SPKI through DER so the key owns bytes independent
        // of the certificate object.
        let spki_der = parsed.tbs_certificate.subject_public_key_info.to_der()?;
        let public_key = PublicKey::from_spki_der(&spki_der)?;
        debug!("materializing delegated {} key", public_key.algorithm().name());

        self.engine
            .lookup_method(public_key.algorithm())
            .ok_or(OffloadError::MethodTable {
                algorithm: public_key.algorithm().name(),
            })?;

        let id = KeyId::next();
        let key = DelegatedKey::new(id, public_key, Arc::clone(&self.engine));
        self.engine.registry().attach(id, signer);
        Ok(Arc::new(key))
    }
}

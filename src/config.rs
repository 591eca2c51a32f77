//! Wiring delegated keys into rustls configurations.
//!
//! rustls fixes protocol versions and key material when a config is built,
//! so installation is expressed as construction: every fallible step (PEM
//! parse, materialization, registry attachment) runs before a config exists,
//! which makes a failed installation leave nothing behind.

use std::sync::Arc;

use log::debug;
use pki_types::pem::PemObject;
use pki_types::CertificateDer;
use rustls::client::ResolvesClientCert;
use rustls::crypto::ring;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::TLS13;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SignatureScheme};

use crate::engine::SigningEngine;
use crate::error::OffloadError;
use crate::key::KeyMaterializer;
use crate::signer::ExternalSigner;

/// Builds TLS configurations whose private-key operations are delegated to
/// an external signer.
///
/// [`OffloadInstaller::new`] binds to the process-wide engine, constructing
/// it on first use; repeated installers share it. Tests inject a private
/// engine with [`OffloadInstaller::with_engine`].
pub struct OffloadInstaller {
    engine: Arc<SigningEngine>,
}

impl OffloadInstaller {
    pub fn new() -> Result<Self, OffloadError> {
        Ok(Self {
            engine: SigningEngine::global()?,
        })
    }

    pub fn with_engine(engine: Arc<SigningEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SigningEngine> {
        &self.engine
    }

    /// Parse a PEM certificate chain (leaf first), materialize the delegated
    /// key for the leaf, and bundle both for use by a resolver.
    pub fn certified_key(
        &self,
        signer: Arc<dyn ExternalSigner>,
        cert_pem: &str,
    ) -> Result<CertifiedKey, OffloadError> {
        let chain: Vec<CertificateDer<'static>> =
            CertificateDer::pem_slice_iter(cert_pem.as_bytes()).collect::<Result<_, _>>()?;
        let leaf = chain.first().ok_or(OffloadError::EmptyCertChain)?;
        let key = KeyMaterializer::new(Arc::clone(&self.engine)).materialize(signer, leaf)?;
        Ok(CertifiedKey::new(chain, key))
    }

    /// A server config presenting `cert_pem` and signing with `signer`.
    ///
    /// The minimum protocol version is pinned to the highest the library
    /// defines ([`rustls::version::TLS13`]).
    pub fn server_config(
        &self,
        signer: Arc<dyn ExternalSigner>,
        cert_pem: &str,
    ) -> Result<ServerConfig, OffloadError> {
        debug!("installing offloaded key into server config");
        let certified = Arc::new(self.certified_key(signer, cert_pem)?);
        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_protocol_versions(&[&TLS13])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(StaticResolver { certified }));
        Ok(config)
    }

    /// A client config authenticating with `cert_pem` (mutual TLS) and
    /// signing with `signer`, trusting `roots` for the server's chain.
    pub fn client_config(
        &self,
        signer: Arc<dyn ExternalSigner>,
        cert_pem: &str,
        roots: RootCertStore,
    ) -> Result<ClientConfig, OffloadError> {
        debug!("installing offloaded key into client config");
        let certified = Arc::new(self.certified_key(signer, cert_pem)?);
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_protocol_versions(&[&TLS13])?
            .with_root_certificates(roots)
            .with_client_cert_resolver(Arc::new(StaticResolver { certified }));
        Ok(config)
    }
}

/// Resolves every handshake to the one certified key it was built with,
/// provided the peer offers a scheme the delegated key can serve.
#[derive(Debug)]
struct StaticResolver {
    certified: Arc<CertifiedKey>,
}

impl ResolvesServerCert for StaticResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified
            .key
            .choose_scheme(client_hello.signature_schemes())
            .is_some()
            .then(|| Arc::clone(&self.certified))
    }
}

impl ResolvesClientCert for StaticResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.certified
            .key
            .choose_scheme(sigschemes)
            .is_some()
            .then(|| Arc::clone(&self.certified))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

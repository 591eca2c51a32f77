//! End-to-end handshakes against a delegated key, with all records shuttled
//! through in-memory buffers.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use p256::ecdsa::DerSignature;
use p256::pkcs8::DecodePrivateKey;
use rustls::client::ClientConnection;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ServerConnection, WebPkiClientVerifier};
use rustls::version::TLS13;
use rustls::{ClientConfig, Connection, ProtocolVersion, RootCertStore, ServerConfig};
use signature::Signer as _;

use tls_offload::{ExternalSigner, OffloadInstaller, SignError, SigningEngine};

/// External signer backed by a P-256 key held outside the TLS stack,
/// counting how often it is asked for a real signature.
#[derive(Debug)]
struct P256Signer {
    key: p256::ecdsa::SigningKey,
    signatures: AtomicUsize,
}

impl P256Signer {
    fn new(key: p256::ecdsa::SigningKey) -> Self {
        Self {
            key,
            signatures: AtomicUsize::new(0),
        }
    }
}

impl ExternalSigner for P256Signer {
    fn signature_len(&self, _message: &[u8]) -> Result<usize, SignError> {
        // Maximal DER encoding of an ECDSA (r, s) pair over P-256.
        Ok(72)
    }

    fn sign(&self, message: &[u8], signature: &mut [u8]) -> Result<usize, SignError> {
        let sig: DerSignature = self.key.sign(message);
        let der = sig.as_bytes();
        if der.len() > signature.len() {
            return Err(SignError::BufferTooSmall {
                needed: der.len(),
                have: signature.len(),
            });
        }
        signature[..der.len()].copy_from_slice(der);
        self.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(der.len())
    }
}

/// Signer whose backend is permanently unavailable.
#[derive(Debug)]
struct BrokenSigner;

impl ExternalSigner for BrokenSigner {
    fn signature_len(&self, _message: &[u8]) -> Result<usize, SignError> {
        Ok(72)
    }

    fn sign(&self, _message: &[u8], _signature: &mut [u8]) -> Result<usize, SignError> {
        Err(SignError::External("backend unavailable".into()))
    }
}

struct TestPki {
    ca: rcgen::Certificate,
    ca_der: CertificateDer<'static>,
}

impl TestPki {
    fn new() -> Self {
        let mut ca_params = rcgen::CertificateParams::new(vec![]);
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = rcgen::Certificate::from_params(ca_params).unwrap();
        let ca_der = CertificateDer::from(ca.serialize_der().unwrap());
        Self { ca, ca_der }
    }

    /// An end-entity certificate signed by the CA, returned as PEM together
    /// with its private key (the "externally held" credential).
    fn end_entity(&self, name: &str) -> (String, p256::ecdsa::SigningKey) {
        let params = rcgen::CertificateParams::new(vec![name.to_string()]);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        let pem = cert.serialize_pem_with_signer(&self.ca).unwrap();
        let key =
            p256::ecdsa::SigningKey::from_pkcs8_der(&cert.get_key_pair().serialize_der()).unwrap();
        (pem, key)
    }

    /// An end-entity certificate plus key in rustls-native form, for the
    /// non-delegated side of a handshake.
    fn end_entity_der(&self, name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let params = rcgen::CertificateParams::new(vec![name.to_string()]);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        let der = CertificateDer::from(cert.serialize_der_with_signer(&self.ca).unwrap());
        let key =
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der()));
        (der, key)
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        roots
    }
}

/// Flush everything `from` wants to write into `to` and process it.
fn pump(from: &mut Connection, to: &mut Connection) -> Result<(), rustls::Error> {
    while from.wants_write() {
        let mut buf = Vec::new();
        from.write_tls(&mut buf).unwrap();
        let mut rd = &buf[..];
        while !rd.is_empty() {
            to.read_tls(&mut rd).unwrap();
        }
        to.process_new_packets()?;
    }
    Ok(())
}

fn run_handshake(client: &mut Connection, server: &mut Connection) -> Result<(), rustls::Error> {
    let mut rounds = 0;
    while client.is_handshaking() || server.is_handshaking() {
        pump(client, server)?;
        pump(server, client)?;
        rounds += 1;
        assert!(rounds < 16, "handshake made no progress");
    }
    Ok(())
}

fn plain_client_config(pki: &TestPki) -> ClientConfig {
    ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&TLS13])
        .unwrap()
        .with_root_certificates(pki.roots())
        .with_no_client_auth()
}

#[test]
fn server_offload_completes_tls13_handshake() {
    let _ = env_logger::builder().is_test(true).try_init();

    let pki = TestPki::new();
    let (server_pem, server_key) = pki.end_entity("localhost");
    let signer = Arc::new(P256Signer::new(server_key));

    let installer = OffloadInstaller::with_engine(SigningEngine::new().unwrap());
    let server_config = installer
        .server_config(Arc::clone(&signer) as Arc<dyn ExternalSigner>, &server_pem)
        .unwrap();

    let mut client = Connection::Client(
        ClientConnection::new(
            Arc::new(plain_client_config(&pki)),
            "localhost".try_into().unwrap(),
        )
        .unwrap(),
    );
    let mut server =
        Connection::Server(ServerConnection::new(Arc::new(server_config)).unwrap());

    run_handshake(&mut client, &mut server).unwrap();

    // One CertificateVerify signature, delegated exactly once.
    assert_eq!(signer.signatures.load(Ordering::SeqCst), 1);
    assert_eq!(client.protocol_version(), Some(ProtocolVersion::TLSv1_3));

    // The connection carries data both ways.
    client.writer().write_all(b"ping").unwrap();
    pump(&mut client, &mut server).unwrap();
    let mut received = [0u8; 4];
    server.reader().read_exact(&mut received).unwrap();
    assert_eq!(&received, b"ping");
}

#[test]
fn client_offload_completes_mutual_tls_handshake() {
    let _ = env_logger::builder().is_test(true).try_init();

    let pki = TestPki::new();
    let (client_pem, client_key) = pki.end_entity("client.example");
    let signer = Arc::new(P256Signer::new(client_key));

    let installer = OffloadInstaller::with_engine(SigningEngine::new().unwrap());
    let client_config = installer
        .client_config(
            Arc::clone(&signer) as Arc<dyn ExternalSigner>,
            &client_pem,
            pki.roots(),
        )
        .unwrap();

    // The server side holds its key conventionally and demands client auth.
    let (server_der, server_key) = pki.end_entity_der("localhost");
    let verifier = WebPkiClientVerifier::builder_with_provider(
        Arc::new(pki.roots()),
        Arc::new(ring::default_provider()),
    )
    .build()
    .unwrap();
    let server_config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&TLS13])
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![server_der], server_key)
        .unwrap();

    let mut client = Connection::Client(
        ClientConnection::new(Arc::new(client_config), "localhost".try_into().unwrap()).unwrap(),
    );
    let mut server =
        Connection::Server(ServerConnection::new(Arc::new(server_config)).unwrap());

    run_handshake(&mut client, &mut server).unwrap();

    assert_eq!(signer.signatures.load(Ordering::SeqCst), 1);
    let peer_certs = server.peer_certificates().unwrap();
    assert!(!peer_certs.is_empty());
}

#[test]
fn failing_signer_aborts_the_handshake() {
    let _ = env_logger::builder().is_test(true).try_init();

    let pki = TestPki::new();
    let (server_pem, _server_key) = pki.end_entity("localhost");

    let installer = OffloadInstaller::with_engine(SigningEngine::new().unwrap());
    let server_config = installer
        .server_config(Arc::new(BrokenSigner), &server_pem)
        .unwrap();

    let mut client = Connection::Client(
        ClientConnection::new(
            Arc::new(plain_client_config(&pki)),
            "localhost".try_into().unwrap(),
        )
        .unwrap(),
    );
    let mut server =
        Connection::Server(ServerConnection::new(Arc::new(server_config)).unwrap());

    let result = run_handshake(&mut client, &mut server);
    assert!(result.is_err(), "handshake must fail when signing fails");
}

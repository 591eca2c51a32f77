//! Per-algorithm key-operation tables.
//!
//! A [`SignMethod`] is the set of entry points a delegated key consults for
//! signature operations, mirroring the shape of a native crypto library's
//! per-algorithm method table. [`SignMethod::delegated`] starts from the
//! default table for the algorithm, copies every entry through, and replaces
//! only the sign entry with [`delegated_sign`], which routes the request to
//! the signer handle registered for the key.

use log::trace;
use rustls::SignatureScheme;

use crate::error::{OffloadError, SignError};
use crate::key::{DelegatedKey, KeyAlgorithm};

/// State for one signature operation, threaded through the table's entries.
pub(crate) struct SignOp<'a> {
    pub(crate) key: &'a DelegatedKey,
    pub(crate) scheme: SignatureScheme,
}

/// Queries answered by a table's ctrl entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtrlQuery {
    /// Size of the key in bits.
    KeyBits,
    /// Upper bound on the size of a signature, in bytes.
    MaxSignatureLen,
}

/// How the TLS stack must drive the sign entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MethodFlags {
    /// The entry receives the exact to-be-signed bytes and performs its own
    /// digesting; the stack must not pre-hash.
    pub(crate) direct_sign: bool,
    /// Output length is not known up front; the stack must perform the
    /// two-phase query (no buffer, then a sized buffer).
    pub(crate) variable_len_output: bool,
}

type InitFn = fn(&SignOp<'_>) -> Result<(), SignError>;
type CleanupFn = fn(&mut SignOp<'_>);
type CtrlFn = fn(&SignOp<'_>, CtrlQuery) -> usize;
type SignFn = fn(&SignOp<'_>, Option<&mut [u8]>, &mut usize, &[u8]) -> Result<(), SignError>;

/// One per-algorithm operation table. Constructed once per process and never
/// mutated afterwards; shared by every delegated key of its algorithm.
pub(crate) struct SignMethod {
    pub(crate) algorithm: KeyAlgorithm,
    pub(crate) flags: MethodFlags,
    pub(crate) init: InitFn,
    pub(crate) cleanup: CleanupFn,
    pub(crate) ctrl: CtrlFn,
    pub(crate) sign: SignFn,
}

impl SignMethod {
    /// The default table for `algorithm`: key-size and signature-length
    /// queries answered from the public key, scheme validation on init, and a
    /// sign entry that fails because a public-key wrapper holds no private
    /// material.
    fn default_for(algorithm: KeyAlgorithm) -> Result<Self, OffloadError> {
        // Both supported algorithms share the default entries; the match
        // stays exhaustive so a new algorithm cannot pick up a table without
        // one being defined for it.
        match algorithm {
            KeyAlgorithm::Rsa | KeyAlgorithm::Ec => Ok(Self {
                algorithm,
                flags: MethodFlags::default(),
                init: default_init,
                cleanup: default_cleanup,
                ctrl: default_ctrl,
                sign: default_sign,
            }),
        }
    }

    /// The delegating table for `algorithm`: every default entry copied
    /// verbatim, the sign entry replaced, and the flags raised so the TLS
    /// stack hands over the full to-be-signed buffer and honors the
    /// two-phase output convention.
    pub(crate) fn delegated(algorithm: KeyAlgorithm) -> Result<Self, OffloadError> {
        let mut method = Self::default_for(algorithm)?;
        method.flags = MethodFlags {
            direct_sign: true,
            variable_len_output: true,
        };
        method.sign = delegated_sign;
        Ok(method)
    }
}

fn default_init(op: &SignOp<'_>) -> Result<(), SignError> {
    if op.key.supports_scheme(op.scheme) {
        Ok(())
    } else {
        Err(SignError::UnsupportedScheme(op.scheme))
    }
}

fn default_cleanup(_op: &mut SignOp<'_>) {}

fn default_ctrl(op: &SignOp<'_>, query: CtrlQuery) -> usize {
    match query {
        CtrlQuery::KeyBits => op.key.public_key_info().bits(),
        CtrlQuery::MaxSignatureLen => op.key.public_key_info().max_signature_len(),
    }
}

fn default_sign(
    _op: &SignOp<'_>,
    _sig: Option<&mut [u8]>,
    _sig_len: &mut usize,
    _tbs: &[u8],
) -> Result<(), SignError> {
    Err(SignError::NoPrivateMaterial)
}

/// The delegating sign entry point.
///
/// Resolves the key's signer handle through the engine's registry and passes
/// the request through: no buffer means phase one (length query only), a
/// buffer means phase two (compute the signature). The to-be-signed bytes are
/// forwarded unmodified, and `sig_len` is written only on success.
fn delegated_sign(
    op: &SignOp<'_>,
    sig: Option<&mut [u8]>,
    sig_len: &mut usize,
    tbs: &[u8],
) -> Result<(), SignError> {
    let signer = op
        .key
        .engine()
        .registry()
        .resolve(op.key.id())
        .ok_or(SignError::MissingSigner)?;

    match sig {
        None => {
            let needed = signer.signature_len(tbs)?;
            trace!("delegated sign length query: {} bytes for {} tbs bytes", needed, tbs.len());
            *sig_len = needed;
        }
        Some(buf) => {
            let written = signer.sign(tbs, buf)?;
            trace!("delegated sign: {} bytes for {} tbs bytes", written, tbs.len());
            *sig_len = written;
        }
    }
    Ok(())
}

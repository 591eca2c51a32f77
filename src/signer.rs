use core::fmt;

use crate::error::SignError;

/// A caller-supplied signing capability backed by key material this crate
/// never sees: an HSM, a remote KMS, an OS credential store.
///
/// Implementations are invoked synchronously on whatever thread the TLS
/// library performs the handshake on, possibly from many handshakes at once,
/// and may block for as long as the backend needs; no timeout is imposed.
///
/// The two methods are the two phases of the underlying crypto calling
/// convention: the TLS stack first asks how large a signature may be, then
/// provides a buffer of that size for the real computation.
pub trait ExternalSigner: fmt::Debug + Send + Sync {
    /// Report an upper bound on the size of a signature over `message`.
    ///
    /// Must not produce a signature or any other side effect that signing
    /// would have (audit log entries, key-usage counters, ...).
    fn signature_len(&self, message: &[u8]) -> Result<usize, SignError>;

    /// Sign `message` into `signature`, returning the exact number of bytes
    /// written. `signature` is at least as large as the most recent
    /// [`signature_len`](ExternalSigner::signature_len) answer.
    ///
    /// The message is passed through exactly as the TLS stack produced it;
    /// the signer digests and formats it according to its key's algorithm.
    fn sign(&self, message: &[u8], signature: &mut [u8]) -> Result<usize, SignError>;
}

/// [`ExternalSigner`] adapter for callers whose backend is a single function
/// producing a signature of bounded size.
pub struct CallbackSigner<F> {
    max_len: usize,
    callback: F,
}

impl<F> CallbackSigner<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, SignError> + Send + Sync,
{
    /// Wrap `callback`. `max_len` bounds the length of every signature the
    /// callback can return; longer results fail the sign operation.
    pub fn new(max_len: usize, callback: F) -> Self {
        Self { max_len, callback }
    }
}

impl<F> fmt::Debug for CallbackSigner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSigner")
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

impl<F> ExternalSigner for CallbackSigner<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, SignError> + Send + Sync,
{
    fn signature_len(&self, _message: &[u8]) -> Result<usize, SignError> {
        Ok(self.max_len)
    }

    fn sign(&self, message: &[u8], signature: &mut [u8]) -> Result<usize, SignError> {
        let sig = (self.callback)(message)?;
        if sig.len() > signature.len() {
            return Err(SignError::BufferTooSmall {
                needed: sig.len(),
                have: signature.len(),
            });
        }
        signature[..sig.len()].copy_from_slice(&sig);
        Ok(sig.len())
    }
}

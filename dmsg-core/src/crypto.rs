//! Crypto adapter (spec §6): an opaque negotiate/encrypt/decrypt hook, an
//! external collaborator per spec's own framing. No real cipher lives
//! here -- that's explicitly out of scope -- just the seam and the no-op
//! implementation used whenever encryption is off.

/// Implemented by whatever session-crypto layer a transport wants to
/// plug in. `decrypt` is expected to advance the caller's FIFO cursor by
/// a block multiple as cleartext becomes available; `encrypt` consumes
/// plaintext iovecs and repoints them at a staging buffer, reporting how
/// much plaintext it actually consumed (spec §6, §4.9).
pub trait CryptoAdapter: Send {
    /// Negotiates session keys over the raw connection. Called once at
    /// `IOCom` construction for socket-backed connections (not for a
    /// pre-trusted local pipe).
    fn negotiate(&mut self) -> Result<(), crate::error::DmsgError>;

    /// Decrypts whatever ciphertext is available, appending cleartext to
    /// `out` and returning the number of ciphertext bytes consumed.
    fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> usize;

    /// Encrypts `plaintext`, appending ciphertext to `out` and returning
    /// the number of plaintext bytes actually consumed (may be less than
    /// the whole buffer if the adapter works in fixed blocks).
    fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> usize;

    fn is_active(&self) -> bool;
}

/// The default adapter: cleartext framing, `negotiate` always succeeds
/// immediately, `decrypt`/`encrypt` are identity copies. This is the
/// "plaintext mode keeps cdx = cdn = end" case spec §4.8 describes.
#[derive(Default)]
pub struct PlaintextAdapter;

impl CryptoAdapter for PlaintextAdapter {
    fn negotiate(&mut self) -> Result<(), crate::error::DmsgError> {
        Ok(())
    }

    fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> usize {
        out.extend_from_slice(ciphertext);
        ciphertext.len()
    }

    fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> usize {
        out.extend_from_slice(plaintext);
        plaintext.len()
    }

    fn is_active(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_adapter_is_identity() {
        let mut a = PlaintextAdapter;
        let mut out = Vec::new();
        assert_eq!(a.decrypt(b"hello", &mut out), 5);
        assert_eq!(out, b"hello");
        let mut out2 = Vec::new();
        assert_eq!(a.encrypt(b"world", &mut out2), 5);
        assert_eq!(out2, b"world");
        assert!(!a.is_active());
    }
}

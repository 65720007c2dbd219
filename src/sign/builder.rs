use hmac::{Hmac, Mac};
use log::trace;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha1::Sha1;

use super::{
    DigestAlgorithm, SignError, Signer, CUSTOMER_KEY_INDEX, MAX_ROLLBACK_VERSION, RSA_MODULUS_SIZE,
    SIGNED_IMAGE_MAX_SIZE,
};

type HmacSha1 = Hmac<Sha1>;

/// Append-only accumulator for the signed image byte stream.
///
/// Every append adds one field at the current position and nothing is ever
/// reordered - a signature or digest only covers the bytes that were present
/// when it was appended. Validation always happens before the field's bytes
/// are written, so a failed append leaves the buffer untouched.
pub struct SignedImageBuilder {
    buf: Vec<u8>,
}

impl SignedImageBuilder {
    pub fn new() -> SignedImageBuilder {
        SignedImageBuilder { buf: Vec::new() }
    }

    /// The number of bytes appended so far
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Appends raw payload bytes
    pub fn append_payload(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
    }

    /// Appends the running total length, counting the length field itself
    pub fn append_length(&mut self) {
        let total = self.buf.len() as u32 + 4;

        self.buf.extend_from_slice(&total.to_le_bytes());
    }

    /// Appends the signing key index. Indexes 0-4 and the customer key index
    /// are accepted; anything else is rejected before any bytes are appended.
    pub fn append_key_index(&mut self, index: u32) -> Result<(), SignError> {
        if index > 4 && index != CUSTOMER_KEY_INDEX {
            return Err(SignError::InvalidKeyIndex(index));
        }

        self.buf.extend_from_slice(&index.to_le_bytes());

        Ok(())
    }

    /// Appends the rollback prevention version. The version fuse bank can
    /// only represent 0-32.
    pub fn append_version(&mut self, version: u32) -> Result<(), SignError> {
        if version > MAX_ROLLBACK_VERSION {
            return Err(SignError::InvalidVersion(version));
        }

        self.buf.extend_from_slice(&version.to_le_bytes());

        Ok(())
    }

    /// Appends the 2048 bit RSA public key as a fixed-width little-endian
    /// modulus followed by a 4 byte little-endian exponent
    pub fn append_public_key(&mut self, key: &RsaPublicKey) -> Result<(), SignError> {
        if key.size() != RSA_MODULUS_SIZE {
            return Err(SignError::InvalidKeySize(key.size() * 8));
        }

        let mut modulus = key.n().to_bytes_le();
        modulus.resize(RSA_MODULUS_SIZE, 0);

        let mut exponent = key.e().to_bytes_le();
        exponent.resize(4, 0);

        self.buf.extend_from_slice(&modulus);
        self.buf.extend_from_slice(&exponent);

        Ok(())
    }

    /// Appends a detached signature over all bytes appended so far
    pub fn append_signature(
        &mut self,
        signer: &dyn Signer,
        algorithm: DigestAlgorithm,
    ) -> Result<(), SignError> {
        trace!("Signing {} bytes with {}", self.buf.len(), algorithm.selector());

        let signature = signer.sign(&self.buf, algorithm)?;
        self.buf.extend_from_slice(&signature);

        Ok(())
    }

    /// Appends a keyed HMAC-SHA1 integrity digest over all bytes appended so
    /// far
    pub fn append_digest(&mut self, key: &[u8]) {
        // new_from_slice accepts keys of any length
        let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key length");

        mac.update(&self.buf);

        let digest = mac.finalize().into_bytes();
        self.buf.extend_from_slice(&digest);
    }

    /// Finalizes the image, enforcing the maximum loadable size
    pub fn finish(self) -> Result<Vec<u8>, SignError> {
        if self.buf.len() > SIGNED_IMAGE_MAX_SIZE {
            return Err(SignError::ImageTooBig(self.buf.len()));
        }

        Ok(self.buf)
    }
}

impl Default for SignedImageBuilder {
    fn default() -> SignedImageBuilder {
        SignedImageBuilder::new()
    }
}

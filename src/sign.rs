//! Signed second-stage image construction
//!
//! The boot ROM verifies a signed bootcode image by walking its fields in the
//! exact order they were appended, so the builder never reorders anything:
//! every signature and digest covers precisely the bytes that precede it.

mod backend;
mod builder;

pub use backend::{public_key_from_pem, ExternalSigner, LocalKeySigner, Signer};
pub use builder::SignedImageBuilder;

use std::io;
use std::process::ExitStatus;
use std::str::FromStr;

use rsa::RsaPublicKey;
use thiserror::Error;

/// Largest signed image the boot ROM will load.
pub const SIGNED_IMAGE_MAX_SIZE: usize = 192 * 1024;

/// Key index of the customer signing key held in OTP. Indexes 0-4 select the
/// device maker's keys.
pub const CUSTOMER_KEY_INDEX: u32 = 16;

/// Highest rollback version representable in the version fuse bank.
pub const MAX_ROLLBACK_VERSION: u32 = 32;

/// Modulus width in bytes of the only accepted signing key size.
pub const RSA_MODULUS_SIZE: usize = 256;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("Key index {} is not valid - expected 0-4 or {}", _0, CUSTOMER_KEY_INDEX)]
    InvalidKeyIndex(u32),

    #[error("Rollback version {} is not valid - expected 0-{}", _0, MAX_ROLLBACK_VERSION)]
    InvalidVersion(u32),

    #[error("The signing key is {} bits - only 2048 bit RSA keys are supported", _0)]
    InvalidKeySize(usize),

    #[error("The signed image is {} bytes which exceeds the {} byte limit", _0, SIGNED_IMAGE_MAX_SIZE)]
    ImageTooBig(usize),

    #[error("Could not parse the PKCS#8 encoded key: {}", _0)]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("Could not parse the PKCS#1 encoded key: {}", _0)]
    Pkcs1(#[from] rsa::pkcs1::Error),

    #[error("Could not parse the public key: {}", _0)]
    Spki(#[from] rsa::pkcs8::spki::Error),

    #[error("RSA signing failed: {}", _0)]
    Signature(#[from] rsa::signature::Error),

    #[error("The external signer exited with {}: {}", _0, _1)]
    ExternalSignerFailed(ExitStatus, String),

    #[error("The external signer returned invalid hex: {}", _0)]
    SignatureDecode(#[from] hex::FromHexError),

    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
}

/// Digest algorithm a signature is computed over
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// The selector string passed to external signing tools
    pub fn selector(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

/// Target chip family for a signed image
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Chip {
    Bcm2711,
    Bcm2712,
}

impl FromStr for Chip {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "2711" | "bcm2711" => Ok(Chip::Bcm2711),
            "2712" | "bcm2712" => Ok(Chip::Bcm2712),
            other => Err(format!("unknown chip family '{}'", other)),
        }
    }
}

/// Builds a signed image for the BCM2711 boot ROM:
/// payload, total length, key index, an RSA signature over SHA-1, then a
/// keyed HMAC-SHA1 integrity digest.
pub fn sign_bcm2711(
    payload: &[u8],
    key_index: u32,
    signer: &dyn Signer,
    hmac_key: &[u8],
) -> Result<Vec<u8>, SignError> {
    let mut builder = SignedImageBuilder::new();

    builder.append_payload(payload);
    builder.append_length();
    builder.append_key_index(key_index)?;
    builder.append_signature(signer, DigestAlgorithm::Sha1)?;
    builder.append_digest(hmac_key);

    builder.finish()
}

/// Builds a signed image for the BCM2712 boot ROM:
/// payload, total length, key index, rollback version, an RSA signature over
/// SHA-256, then the serialized public key. The embedded key carries the
/// trust chain, so no integrity digest is appended.
pub fn sign_bcm2712(
    payload: &[u8],
    key_index: u32,
    version: u32,
    signer: &dyn Signer,
    public_key: &RsaPublicKey,
) -> Result<Vec<u8>, SignError> {
    let mut builder = SignedImageBuilder::new();

    builder.append_payload(payload);
    builder.append_length();
    builder.append_key_index(key_index)?;
    builder.append_version(version)?;
    builder.append_signature(signer, DigestAlgorithm::Sha256)?;
    builder.append_public_key(public_key)?;

    builder.finish()
}

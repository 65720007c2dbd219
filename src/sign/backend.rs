use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, trace};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer as _};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use tempfile::NamedTempFile;

use super::{DigestAlgorithm, SignError, RSA_MODULUS_SIZE};

/// Produces a detached signature over a byte buffer with a private key
/// identified out-of-band
pub trait Signer {
    fn sign(&self, data: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>, SignError>;
}

/// Parses a PEM encoded RSA public key, accepting both the PKCS#1 and SPKI
/// framings
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, SignError> {
    let key = if pem.contains("BEGIN RSA PUBLIC KEY") {
        RsaPublicKey::from_pkcs1_pem(pem)?
    } else {
        RsaPublicKey::from_public_key_pem(pem)?
    };

    Ok(key)
}

/// Signing backend backed by a PEM encoded RSA private key on disk
pub struct LocalKeySigner {
    key: RsaPrivateKey,
}

impl LocalKeySigner {
    /// Loads the PEM encoded private key stored at `path`
    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<LocalKeySigner, SignError> {
        debug!("Loading signing key from {:?}", path.as_ref());

        Self::from_pem(&fs::read_to_string(path)?)
    }

    /// Parses a PEM encoded private key, accepting both the PKCS#1 and
    /// PKCS#8 framings, and asserts that it is exactly 2048 bits
    pub fn from_pem(pem: &str) -> Result<LocalKeySigner, SignError> {
        let key = if pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(pem)?
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem)?
        };

        if key.size() != RSA_MODULUS_SIZE {
            return Err(SignError::InvalidKeySize(key.size() * 8));
        }

        Ok(LocalKeySigner { key })
    }

    /// The public half of the signing key, for recipes that embed it
    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }
}

impl Signer for LocalKeySigner {
    fn sign(&self, data: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>, SignError> {
        let signature = match algorithm {
            DigestAlgorithm::Sha1 => SigningKey::<Sha1>::new(self.key.clone())
                .try_sign(data)?
                .to_vec(),
            DigestAlgorithm::Sha256 => SigningKey::<Sha256>::new(self.key.clone())
                .try_sign(data)?
                .to_vec(),
        };

        Ok(signature)
    }
}

/// Signing backend that delegates to an external command.
///
/// The command is invoked as `<command> -a <sha1|sha256> <path>` where the
/// path names a temporary file holding the exact bytes to sign. It must print
/// the signature as a hex string on stdout and exit zero; any other outcome
/// aborts the signing run.
pub struct ExternalSigner {
    command: PathBuf,
}

impl ExternalSigner {
    pub fn new<P: Into<PathBuf>>(command: P) -> ExternalSigner {
        ExternalSigner {
            command: command.into(),
        }
    }
}

impl Signer for ExternalSigner {
    fn sign(&self, data: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>, SignError> {
        // The temp file is removed when `file` drops, on success and on every
        // error path below
        let mut file = NamedTempFile::new()?;

        file.write_all(data)?;
        file.flush()?;

        debug!(
            "Invoking external signer {:?} over {} bytes",
            self.command,
            data.len()
        );

        let output = Command::new(&self.command)
            .arg("-a")
            .arg(algorithm.selector())
            .arg(file.path())
            .output()?;

        if !output.status.success() {
            return Err(SignError::ExternalSignerFailed(
                output.status,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let signature = hex::decode(stdout.trim())?;

        trace!("External signer returned {} signature bytes", signature.len());

        Ok(signature)
    }
}

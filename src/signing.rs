//! Ed25519 Signatures for Update Binaries
//!
//! The privileged service only runs binaries it trusts. Publishers sign the
//! SHA-256 digest of each binary (updater, service) and ship the signature
//! next to it as `<binary>.sig`; before taking the privileged path the
//! orchestrator checks those signatures against a trusted public key.
//!
//! # Security Model
//!
//! - **What is signed**: the raw 32-byte SHA-256 digest of the binary
//! - **Algorithm**: Ed25519
//! - **Signature format**: base64 text in `<binary>.sig`
//!
//! # Usage
//!
//! ```bash
//! upstage key generate --output ~/.config/upstage/signing.key
//! upstage sign --key ~/.config/upstage/signing.key ./dist/updater ./dist/upstage-service
//! ```

use crate::error::UpdateError;
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of detached signature files
pub const SIGNATURE_EXTENSION: &str = "sig";

/// A keypair for signing binaries
pub struct SigningKeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Load a keypair from a file
    ///
    /// File format: 64 bytes (32-byte seed + 32-byte public key) base64-encoded
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file: {:?}", path))?;

        let key_bytes = BASE64
            .decode(contents.trim())
            .context("Invalid base64 in key file")?;

        if key_bytes.len() != 64 {
            bail!("Invalid key file: expected 64 bytes, got {}", key_bytes.len());
        }

        let seed: [u8; 32] = key_bytes[..32]
            .try_into()
            .context("Failed to extract seed from key file")?;

        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();

        if verifying_key.as_bytes()[..] != key_bytes[32..] {
            bail!("Invalid key file: public half does not match the seed");
        }

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Save the keypair to a file, readable only by the owner
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut key_bytes = [0u8; 64];
        key_bytes[..32].copy_from_slice(self.signing_key.as_bytes());
        key_bytes[32..].copy_from_slice(self.verifying_key.as_bytes());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create key directory: {:?}", parent))?;
        }

        fs::write(path, BASE64.encode(key_bytes))
            .with_context(|| format!("Failed to write key file: {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Public key as base64, the form the configuration trusts
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key.as_bytes())
    }

    /// Sign data and return the signature as base64
    pub fn sign(&self, data: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(data).to_bytes())
    }

    /// Sign a binary's digest and write `<binary>.sig` next to it
    pub fn sign_file(&self, binary: &Path) -> Result<PathBuf> {
        let digest = file_digest(binary)?;
        let sig_path = signature_path(binary);

        fs::write(&sig_path, self.sign(&digest))
            .with_context(|| format!("Failed to write signature: {:?}", sig_path))?;

        tracing::info!("Signed {} ({})", binary.display(), hex::encode(digest));
        Ok(sig_path)
    }
}

/// Verify a base64 signature over `data` with a base64 public key
///
/// `Ok(false)` means well-formed but not valid; malformed input is an error.
pub fn verify_signature(
    data: &[u8],
    signature_base64: &str,
    public_key_base64: &str,
) -> Result<bool> {
    let public_key_bytes = BASE64
        .decode(public_key_base64.trim())
        .context("Invalid base64 in public key")?;

    let public_key_array: [u8; 32] = public_key_bytes
        .try_into()
        .map_err(|b: Vec<u8>| {
            anyhow::anyhow!("Invalid public key: expected 32 bytes, got {}", b.len())
        })?;

    let verifying_key =
        VerifyingKey::from_bytes(&public_key_array).context("Invalid public key format")?;

    let signature_bytes = BASE64
        .decode(signature_base64.trim())
        .context("Invalid base64 in signature")?;

    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|b: Vec<u8>| {
            anyhow::anyhow!("Invalid signature: expected 64 bytes, got {}", b.len())
        })?;

    let signature = Signature::from_bytes(&signature_array);

    Ok(verifying_key.verify(data, &signature).is_ok())
}

/// `<binary>.sig`
pub fn signature_path(binary: &Path) -> PathBuf {
    let mut name = binary.as_os_str().to_owned();
    name.push(".");
    name.push(SIGNATURE_EXTENSION);
    PathBuf::from(name)
}

/// SHA-256 of a file's contents
pub fn file_digest(path: &Path) -> Result<[u8; 32]> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(Sha256::digest(&bytes).into())
}

/// Check `<binary>.sig` against the trusted key
pub fn verify_file(binary: &Path, public_key_base64: &str) -> std::result::Result<(), UpdateError> {
    let reject = |reason: String| UpdateError::Signature {
        path: binary.to_path_buf(),
        reason,
    };

    let digest = file_digest(binary).map_err(|e| reject(format!("{:#}", e)))?;

    let sig_path = signature_path(binary);
    let signature = fs::read_to_string(&sig_path)
        .map_err(|e| reject(format!("no signature at {}: {}", sig_path.display(), e)))?;

    match verify_signature(&digest, &signature, public_key_base64) {
        Ok(true) => {
            tracing::debug!("Signature accepted for {}", binary.display());
            Ok(())
        }
        Ok(false) => Err(reject("signature does not match the trusted key".to_string())),
        Err(e) => Err(reject(format!("{:#}", e))),
    }
}

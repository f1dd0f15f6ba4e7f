use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use prisma_core::error::PrismaError;
use prisma_core::types::VerifyKeyHex;

use crate::hash::address_from_verify_key;

/// Length of an Ed25519 signature in bytes.
const SIGNATURE_LEN: usize = 64;

/// Output of a signing operation, in both attached and detached form.
///
/// `signed` is hex(signature ‖ message) — the blob contains the message and
/// can be opened with the verify key alone. `sig_detached` is hex(signature)
/// and must be paired with the message out of band.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedData {
    pub signed: String,
    pub sig_detached: String,
    pub verify_key: VerifyKeyHex,
}

/// A Prisma node keypair. The seed is wiped from memory on drop.
pub struct KeyPair {
    signing_key: SigningKey,
    verify_key_hex: VerifyKeyHex,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        Self::from_signing_key(signing_key)
    }

    /// Restore a keypair from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, PrismaError> {
        let seed = Zeroizing::new(
            hex::decode(seed_hex).map_err(|_| PrismaError::Keystore("bad seed hex".into()))?,
        );
        let bytes: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| PrismaError::Keystore("seed must be 32 bytes".into()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verify_key_hex = hex::encode(signing_key.verifying_key().as_bytes());
        Self { signing_key, verify_key_hex }
    }

    pub fn verify_key_hex(&self) -> &VerifyKeyHex {
        &self.verify_key_hex
    }

    pub fn seed_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    /// Wallet address of this node's key.
    pub fn address(&self) -> Result<String, PrismaError> {
        address_from_verify_key(&self.verify_key_hex)
    }

    /// Sign `message`, returning attached and detached forms.
    pub fn sign(&self, message: &[u8]) -> SignedData {
        let sig = self.signing_key.sign(message);
        let mut attached = sig.to_bytes().to_vec();
        attached.extend_from_slice(message);
        SignedData {
            signed: hex::encode(attached),
            sig_detached: hex::encode(sig.to_bytes()),
            verify_key: self.verify_key_hex.clone(),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ verify_key: {}… }}", &self.verify_key_hex[..8])
    }
}

fn parse_verify_key(verify_key_hex: &str) -> Result<VerifyingKey, PrismaError> {
    let bytes = hex::decode(verify_key_hex).map_err(|_| PrismaError::InvalidPublicKey)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| PrismaError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| PrismaError::InvalidPublicKey)
}

/// Open an attached signature blob, returning the embedded message.
pub fn verify_attached(verify_key_hex: &str, signed_hex: &str) -> Result<Vec<u8>, PrismaError> {
    let vk = parse_verify_key(verify_key_hex)?;
    let blob = hex::decode(signed_hex).map_err(|_| PrismaError::InvalidSignature)?;
    if blob.len() < SIGNATURE_LEN {
        return Err(PrismaError::InvalidSignature);
    }
    let (sig_bytes, message) = blob.split_at(SIGNATURE_LEN);
    let sig =
        Signature::from_slice(sig_bytes).map_err(|_| PrismaError::InvalidSignature)?;
    vk.verify(message, &sig)
        .map_err(|_| PrismaError::InvalidSignature)?;
    Ok(message.to_vec())
}

/// Verify a detached signature against a message.
pub fn verify_detached(
    verify_key_hex: &str,
    message: &[u8],
    sig_hex: &str,
) -> Result<(), PrismaError> {
    let vk = parse_verify_key(verify_key_hex)?;
    let sig_bytes = hex::decode(sig_hex).map_err(|_| PrismaError::InvalidSignature)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| PrismaError::InvalidSignature)?;
    vk.verify(message, &sig)
        .map_err(|_| PrismaError::InvalidSignature)
}

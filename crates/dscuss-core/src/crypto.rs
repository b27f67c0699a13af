//! Cryptographic primitives: keypair generation, DER/PEM codec, signing and
//! verification over secp224r1, SHA-512, and PBKDF2-HMAC-SHA-512.

use crate::error::CryptoError;
use ecdsa::signature::{Signer, Verifier};
use elliptic_curve::pkcs8::{DecodePublicKey, EncodePublicKey};
use elliptic_curve::sec1::{DecodeEcPrivateKey, EncodeEcPrivateKey, LineEnding};
use p224::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use p224::{NistP224, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use std::path::Path;

/// Salt fed to PBKDF2 during proof-of-work hashing. Shared with [`crate::pow`].
pub const POW_SALT: &[u8] = b"dscuss-proof-of-work";

/// Buffer size of the fixed signature field on the wire.
pub const SIGNATURE_BUF_LEN: usize = 64;

/// A 64-byte SHA-512 digest; the primitive identifier for keys, users and messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; 64]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 64]);

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Number of leading zero bits, scanning from the most significant bit of
    /// byte 0. Returns 512 only for the all-zero hash.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut count = 0u32;
        for byte in self.0.iter() {
            if *byte == 0 {
                count += 8;
                continue;
            }
            count += byte.leading_zeros();
            break;
        }
        count
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// SHA-512 over arbitrary bytes.
pub fn sha512(bytes: &[u8]) -> Hash {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    Hash(out)
}

/// PBKDF2-HMAC-SHA-512 with a 64-byte output, used by the PoW searcher and
/// validator.
pub fn pbkdf2_hmac_sha512(password: &[u8], salt: &[u8], iters: u32) -> Hash {
    let mut out = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iters, &mut out);
    Hash(out)
}

/// A secp224r1 public key, held as the parsed point plus the DER
/// `SubjectPublicKeyInfo` bytes that produced it (so re-encoding is a cheap
/// clone rather than a re-derivation).
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
    der: Vec<u8>,
}

impl PublicKey {
    pub fn to_der(&self) -> Vec<u8> {
        self.der.clone()
    }

    pub fn from_der(bytes: &[u8]) -> Result<Self, CryptoError> {
        let verifying_key = VerifyingKey::from_public_key_der(bytes)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        Ok(Self {
            verifying_key,
            der: bytes.to_vec(),
        })
    }

    /// The user id is `sha512(der(pubkey))`.
    pub fn id(&self) -> Hash {
        sha512(&self.der)
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        let Ok(parsed) = EcdsaSignature::from_der(sig.as_bytes()) else {
            return false;
        };
        self.verifying_key.verify(msg, &parsed).is_ok()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}
impl Eq for PublicKey {}

/// A DER-encoded ECDSA signature, packed into the fixed 64-byte wire buffer
/// with an explicit length.
#[derive(Clone)]
pub struct Signature {
    buf: [u8; SIGNATURE_BUF_LEN],
    len: u16,
}

impl Signature {
    pub fn from_parts(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() > SIGNATURE_BUF_LEN {
            return Err(CryptoError::MalformedSignature);
        }
        let mut buf = [0u8; SIGNATURE_BUF_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            buf,
            len: bytes.len() as u16,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffer as it appears on the wire: DER bytes followed by zero padding.
    pub fn wire_buf(&self) -> &[u8; SIGNATURE_BUF_LEN] {
        &self.buf
    }
}

/// An secp224r1 keypair. The private half never leaves this type except
/// through PEM serialization.
pub struct Keypair {
    signing_key: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        Self::from_secret(secret)
    }

    fn from_secret(secret: SecretKey) -> Self {
        let signing_key = SigningKey::from(secret);
        let verifying_key = VerifyingKey::from(&signing_key);
        let der = verifying_key
            .to_public_key_der()
            .expect("secp224r1 public key always DER-encodes")
            .as_bytes()
            .to_vec();
        let public = PublicKey { verifying_key, der };
        Self {
            signing_key,
            public,
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        let sig: EcdsaSignature = self.signing_key.sign(msg);
        let der = sig.to_der();
        Signature::from_parts(der.as_bytes()).expect("secp224r1 DER signatures fit in 64 bytes")
    }

    /// Write the private key as a SEC1 PEM file, matching
    /// `PEM_write_bio_ECPrivateKey` in the reference implementation. Creates
    /// parent directories if needed.
    pub fn to_pem_file(&self, path: impl AsRef<Path>) -> Result<(), CryptoError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let secret = SecretKey::from(self.signing_key.clone());
        let pem = secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        std::fs::write(path, pem.as_bytes())?;
        Ok(())
    }

    /// Read a keypair from a SEC1 PEM file, creating one (and writing it) if
    /// the file does not yet exist — mirrors
    /// `dscuss_crypto_ecc_private_key_init`'s create-if-missing behavior.
    pub fn from_pem_file_or_create(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_pem_file(path)
        } else {
            let keypair = Self::generate();
            keypair.to_pem_file(path)?;
            Ok(keypair)
        }
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let pem = std::fs::read_to_string(path)?;
        let secret = SecretKey::from_sec1_pem(&pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_zero_bits_all_zero_is_512() {
        assert_eq!(Hash::ZERO.leading_zero_bits(), 512);
    }

    #[test]
    fn leading_zero_bits_first_bit_set() {
        let mut bytes = [0u8; 64];
        bytes[0] = 0b1000_0000;
        assert_eq!(Hash(bytes).leading_zero_bits(), 0);
    }

    #[test]
    fn leading_zero_bits_counts_whole_bytes() {
        let mut bytes = [0u8; 64];
        bytes[1] = 0b0000_0001;
        assert_eq!(Hash(bytes).leading_zero_bits(), 15);
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let kp = Keypair::generate();
        let msg = b"dscuss message prefix";
        let sig = kp.sign(msg);
        assert!(kp.public().verify(msg, &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"original");
        assert!(!kp.public().verify(b"tampered", &sig));
    }

    #[test]
    fn der_roundtrip_is_byte_identical() {
        let kp = Keypair::generate();
        let der = kp.public().to_der();
        let parsed = PublicKey::from_der(&der).unwrap();
        assert_eq!(parsed.to_der(), der);
        assert_eq!(parsed.id(), kp.public().id());
    }

    #[test]
    fn pem_roundtrip_preserves_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privkey.pem");
        let kp = Keypair::generate();
        kp.to_pem_file(&path).unwrap();
        let reloaded = Keypair::from_pem_file(&path).unwrap();
        assert_eq!(reloaded.public().to_der(), kp.public().to_der());
    }

    #[test]
    fn from_pem_file_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privkey.pem");
        let first = Keypair::from_pem_file_or_create(&path).unwrap();
        let second = Keypair::from_pem_file_or_create(&path).unwrap();
        assert_eq!(first.public().to_der(), second.public().to_der());
    }

    #[test]
    fn pbkdf2_is_deterministic() {
        let a = pbkdf2_hmac_sha512(b"pw", POW_SALT, 1);
        let b = pbkdf2_hmac_sha512(b"pw", POW_SALT, 1);
        assert_eq!(a, b);
    }
}

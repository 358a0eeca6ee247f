//! cryptographic primitives for lockwarden
//!
//! - sha256 for labeled digests
//! - chacha20poly1305 for wrapping the unlock secret at rest
//! - ed25519 as the reference signing provider (hkdf path derivation)

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// raw signature bytes
pub type Signature = [u8; 64];

/// raw public key bytes
pub type PublicKey = [u8; 32];

/// sha256 over a domain label followed by each part
pub fn labeled_digest(label: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(label);
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

/// constant-time byte comparison
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// encrypt data using chacha20poly1305
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|e| Error::Wrap(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| Error::Wrap(e.to_string()))
}

/// decrypt data using chacha20poly1305
pub fn decrypt(key: &[u8; 32], ciphertext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|e| Error::Unwrap(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::Unwrap(e.to_string()))
}

/// hardened index bit
pub const HARDENED: u32 = 0x8000_0000;

/// bip32-style derivation path, e.g. `m/7477'/0'`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn new(indices: Vec<u32>) -> Self {
        Self(indices)
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    /// big-endian encoding of every index
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|i| i.to_be_bytes()).collect()
    }
}

impl FromStr for DerivationPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('/');
        if parts.next() != Some("m") {
            return Err(Error::InvalidPath(format!("{:?} must start with 'm'", s)));
        }

        let mut indices = Vec::new();
        for part in parts {
            let (digits, hardened) = match part.strip_suffix('\'').or_else(|| part.strip_suffix('h')) {
                Some(d) => (d, true),
                None => (part, false),
            };
            let index: u32 = digits
                .parse()
                .map_err(|_| Error::InvalidPath(format!("bad component {:?} in {:?}", part, s)))?;
            if index >= HARDENED {
                return Err(Error::InvalidPath(format!("component {} out of range", index)));
            }
            indices.push(if hardened { index | HARDENED } else { index });
        }
        Ok(Self(indices))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for i in &self.0 {
            if i & HARDENED != 0 {
                write!(f, "/{}'", i & !HARDENED)?;
            } else {
                write!(f, "/{}", i)?;
            }
        }
        Ok(())
    }
}

/// signing/verification collaborator
///
/// the core never touches key material directly: it asks the provider to
/// derive a key handle for a path and to sign 32-byte digests with it.
pub trait SignatureProvider {
    /// opaque key handle
    type Key;

    /// derive the key at `path`
    fn derive_key(&self, path: &DerivationPath) -> Result<Self::Key>;

    /// public half of a key handle
    fn public_key(&self, key: &Self::Key) -> PublicKey;

    /// sign a digest
    fn sign(&self, key: &Self::Key, digest: &[u8; 32]) -> Result<Signature>;

    /// verify a signature over `message`
    fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool;

    /// fill `buf` with randomness; false on rng failure
    fn random(&self, buf: &mut [u8]) -> bool;
}

/// ed25519 provider with hkdf path derivation from a device seed
pub struct Ed25519Provider {
    seed: Zeroizing<[u8; 32]>,
}

impl Ed25519Provider {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            seed: Zeroizing::new(seed),
        }
    }

    /// fresh random seed
    pub fn generate() -> Self {
        Self::from_seed(random_bytes())
    }
}

impl SignatureProvider for Ed25519Provider {
    type Key = SigningKey;

    fn derive_key(&self, path: &DerivationPath) -> Result<SigningKey> {
        let hk = Hkdf::<Sha256>::new(None, self.seed.as_slice());
        let mut info = b"lockwarden:ed25519:v1".to_vec();
        info.extend_from_slice(&path.to_bytes());

        let mut key_bytes = Zeroizing::new([0u8; 32]);
        hk.expand(&info, key_bytes.as_mut_slice())
            .map_err(|_| Error::Internal("key derivation failed".into()))?;
        Ok(SigningKey::from_bytes(&key_bytes))
    }

    fn public_key(&self, key: &SigningKey) -> PublicKey {
        key.verifying_key().to_bytes()
    }

    fn sign(&self, key: &SigningKey, digest: &[u8; 32]) -> Result<Signature> {
        Ok(key.sign(digest).to_bytes())
    }

    fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        vk.verify_strict(message, &sig).is_ok()
    }

    fn random(&self, buf: &mut [u8]) -> bool {
        OsRng.try_fill_bytes(buf).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = random_bytes::<32>();
        let nonce = random_bytes::<12>();
        let plaintext = b"hello world";

        let ciphertext = encrypt(&key, plaintext, &nonce).unwrap();
        let decrypted = decrypt(&key, &ciphertext, &nonce).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());

        let other = random_bytes::<32>();
        assert!(decrypt(&other, &ciphertext, &nonce).is_err());
    }

    #[test]
    fn test_path_parse_display() {
        let path: DerivationPath = "m/44'/0h/7".parse().unwrap();
        assert_eq!(path.indices(), &[44 | HARDENED, HARDENED, 7]);
        assert_eq!(path.to_string(), "m/44'/0'/7");

        let root: DerivationPath = "m".parse().unwrap();
        assert!(root.indices().is_empty());

        assert!("44'/0'".parse::<DerivationPath>().is_err());
        assert!("m/x".parse::<DerivationPath>().is_err());
        assert!("m/2147483648".parse::<DerivationPath>().is_err());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let provider = Ed25519Provider::from_seed([7u8; 32]);
        let a: DerivationPath = "m/1'".parse().unwrap();
        let b: DerivationPath = "m/2'".parse().unwrap();

        let ka1 = provider.derive_key(&a).unwrap();
        let ka2 = provider.derive_key(&a).unwrap();
        let kb = provider.derive_key(&b).unwrap();
        assert_eq!(provider.public_key(&ka1), provider.public_key(&ka2));
        assert_ne!(provider.public_key(&ka1), provider.public_key(&kb));
    }

    #[test]
    fn test_sign_verify() {
        let provider = Ed25519Provider::generate();
        let key = provider.derive_key(&"m/0'".parse().unwrap()).unwrap();
        let pk = provider.public_key(&key);
        let digest = labeled_digest(b"test", &[b"message"]);

        let sig = provider.sign(&key, &digest).unwrap();
        assert!(provider.verify(&pk, &digest, &sig));

        let mut bad = sig;
        bad[10] ^= 0x01;
        assert!(!provider.verify(&pk, &digest, &bad));
        assert!(!provider.verify(&pk, b"other", &sig));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}

//! Cryptographic primitives behind small interfaces.
//!
//! Keys and ciphers carry the [`EngineId`] of the engine that produced them,
//! so material from one backend is never fed to another.
//!
//! The bundled [`AesGcmCrypto`] engine derives 32-byte keys with Argon2id and
//! seals data with AES-256-GCM (12-byte IV, 16-byte tag).

use crate::{SecurityError, SecurityResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use kgr_types::config::KdfConfig;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use zeroize::Zeroizing;

/// Identifies one crypto backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(pub u32);

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Secret key material, wiped on drop.
#[derive(Clone)]
pub struct Key {
    engine: EngineId,
    material: Zeroizing<Vec<u8>>,
}

impl Key {
    pub fn new(engine: EngineId, material: Vec<u8>) -> Self {
        Self {
            engine,
            material: Zeroizing::new(material),
        }
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.material
    }

    pub fn len(&self) -> usize {
        self.material.len()
    }

    pub fn is_empty(&self) -> bool {
        self.material.is_empty()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.engine == other.engine && bool::from(self.as_bytes().ct_eq(other.as_bytes()))
    }
}

impl Eq for Key {}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("engine", &self.engine)
            .field("len", &self.material.len())
            .finish_non_exhaustive()
    }
}

/// A cipher instance bound to one key.
pub trait Cipher: Send + Sync {
    fn engine(&self) -> EngineId;

    /// Seal `data` under `iv`. The output may be longer than the input.
    fn encrypt(&self, data: &[u8], iv: &[u8]) -> SecurityResult<Vec<u8>>;

    /// Open data sealed by [`Cipher::encrypt`]. Tampered input is an error.
    fn decrypt(&self, data: &[u8], iv: &[u8]) -> SecurityResult<Vec<u8>>;

    fn block_size(&self) -> usize;

    fn iv_size(&self) -> usize;
}

/// Source of random bytes.
pub trait Random: Send {
    fn next_byte(&mut self) -> u8;

    fn fill(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.next_byte();
        }
    }

    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes);
        u32::from_le_bytes(bytes)
    }
}

/// A crypto backend.
pub trait Crypto: Send + Sync {
    fn engine(&self) -> EngineId;

    /// Stretch a password into a key.
    fn derive_key(&self, password: &str, salt: &str) -> SecurityResult<Key>;

    /// Build a cipher for `key`. Keys from another engine are rejected.
    fn new_cipher(&self, key: &Key) -> SecurityResult<Box<dyn Cipher>>;

    fn new_random(&self) -> Box<dyn Random>;
}

/// Length of derived AES-256 keys.
const KEY_LEN: usize = 32;

/// AES-GCM nonce length.
const IV_LEN: usize = 12;

/// AES block length.
const BLOCK_LEN: usize = 16;

/// AES-256-GCM with Argon2id key derivation.
#[derive(Debug, Clone)]
pub struct AesGcmCrypto {
    engine: EngineId,
    kdf: KdfConfig,
}

impl AesGcmCrypto {
    /// Engine id used by [`AesGcmCrypto::new`].
    pub const ENGINE: EngineId = EngineId(1);

    pub fn new(kdf: KdfConfig) -> Self {
        Self::with_engine(Self::ENGINE, kdf)
    }

    /// Same algorithms under a distinct engine id.
    pub fn with_engine(engine: EngineId, kdf: KdfConfig) -> Self {
        Self { engine, kdf }
    }
}

impl Default for AesGcmCrypto {
    fn default() -> Self {
        Self::new(KdfConfig::default())
    }
}

impl Crypto for AesGcmCrypto {
    fn engine(&self) -> EngineId {
        self.engine
    }

    fn derive_key(&self, password: &str, salt: &str) -> SecurityResult<Key> {
        let params = Params::new(
            self.kdf.memory_kib,
            self.kdf.iterations,
            self.kdf.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| SecurityError::KeyDerivation(format!("invalid Argon2 params: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut material = Zeroizing::new(vec![0u8; KEY_LEN]);
        argon2
            .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut material)
            .map_err(|e| SecurityError::KeyDerivation(e.to_string()))?;
        Ok(Key {
            engine: self.engine,
            material,
        })
    }

    fn new_cipher(&self, key: &Key) -> SecurityResult<Box<dyn Cipher>> {
        if key.engine != self.engine {
            return Err(SecurityError::EngineMismatch {
                key: key.engine.0,
                engine: self.engine.0,
            });
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| SecurityError::Cipher(format!("AES-256 needs a {KEY_LEN}-byte key")))?;
        Ok(Box::new(AesGcmCipher {
            engine: self.engine,
            cipher,
        }))
    }

    fn new_random(&self) -> Box<dyn Random> {
        Box::new(OsSeededRandom(StdRng::from_entropy()))
    }
}

struct AesGcmCipher {
    engine: EngineId,
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    fn nonce(iv: &[u8]) -> SecurityResult<&Nonce<aes_gcm::aead::consts::U12>> {
        if iv.len() != IV_LEN {
            return Err(SecurityError::Cipher(format!(
                "IV must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        Ok(Nonce::from_slice(iv))
    }
}

impl Cipher for AesGcmCipher {
    fn engine(&self) -> EngineId {
        self.engine
    }

    fn encrypt(&self, data: &[u8], iv: &[u8]) -> SecurityResult<Vec<u8>> {
        self.cipher
            .encrypt(Self::nonce(iv)?, data)
            .map_err(|_| SecurityError::Cipher("encryption failed".to_string()))
    }

    fn decrypt(&self, data: &[u8], iv: &[u8]) -> SecurityResult<Vec<u8>> {
        self.cipher
            .decrypt(Self::nonce(iv)?, data)
            .map_err(|_| SecurityError::Decryption)
    }

    fn block_size(&self) -> usize {
        BLOCK_LEN
    }

    fn iv_size(&self) -> usize {
        IV_LEN
    }
}

/// `StdRng` seeded from the operating system.
struct OsSeededRandom(StdRng);

impl Random for OsSeededRandom {
    fn next_byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.0.fill_bytes(&mut byte);
        byte[0]
    }

    fn fill(&mut self, buf: &mut [u8]) {
        self.0.fill_bytes(buf);
    }

    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Cheap Argon2 parameters so tests stay fast.
    pub(crate) fn test_crypto() -> AesGcmCrypto {
        AesGcmCrypto::new(KdfConfig {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        })
    }

    #[test]
    fn test_derive_is_deterministic() {
        let crypto = test_crypto();
        let a = crypto.derive_key("pw", "salt-salt").unwrap();
        let b = crypto.derive_key("pw", "salt-salt").unwrap();
        let c = crypto.derive_key("other", "salt-salt").unwrap();
        let d = crypto.derive_key("pw", "another-salt").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), KEY_LEN);
        assert_eq!(a.engine(), AesGcmCrypto::ENGINE);
    }

    #[test]
    fn test_short_salt_rejected() {
        let err = test_crypto().derive_key("pw", "abc").unwrap_err();
        assert!(matches!(err, SecurityError::KeyDerivation(_)));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = test_crypto();
        let key = crypto.derive_key("pw", "salt-salt").unwrap();
        let cipher = crypto.new_cipher(&key).unwrap();
        let iv = [7u8; IV_LEN];
        let sealed = cipher.encrypt(b"hello kgr", &iv).unwrap();
        assert_ne!(&sealed[..], b"hello kgr");
        assert_eq!(sealed.len(), 9 + BLOCK_LEN);
        assert_eq!(cipher.decrypt(&sealed, &iv).unwrap(), b"hello kgr");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let crypto = test_crypto();
        let right = crypto.new_cipher(&crypto.derive_key("pw", "salt-salt").unwrap()).unwrap();
        let wrong = crypto.new_cipher(&crypto.derive_key("pw2", "salt-salt").unwrap()).unwrap();
        let iv = [1u8; IV_LEN];
        let sealed = right.encrypt(b"secret", &iv).unwrap();
        assert!(matches!(wrong.decrypt(&sealed, &iv), Err(SecurityError::Decryption)));
    }

    #[test]
    fn test_tampering_detected() {
        let crypto = test_crypto();
        let cipher = crypto.new_cipher(&crypto.derive_key("pw", "salt-salt").unwrap()).unwrap();
        let iv = [2u8; IV_LEN];
        let mut sealed = cipher.encrypt(b"payload", &iv).unwrap();
        sealed[0] ^= 0x01;
        assert!(cipher.decrypt(&sealed, &iv).is_err());
    }

    #[test]
    fn test_bad_iv_length() {
        let crypto = test_crypto();
        let cipher = crypto.new_cipher(&crypto.derive_key("pw", "salt-salt").unwrap()).unwrap();
        assert!(matches!(cipher.encrypt(b"x", &[0u8; 4]), Err(SecurityError::Cipher(_))));
    }

    #[test]
    fn test_engine_mismatch() {
        let crypto = test_crypto();
        let foreign = Key::new(EngineId(99), vec![0u8; KEY_LEN]);
        assert!(matches!(
            crypto.new_cipher(&foreign),
            Err(SecurityError::EngineMismatch { key: 99, engine: 1 })
        ));
    }

    #[test]
    fn test_random_produces_varied_output() {
        let mut random = test_crypto().new_random();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random.fill(&mut a);
        random.fill(&mut b);
        assert_ne!(a, b);
        let _ = random.next_byte();
    }

    #[test]
    fn test_key_debug_redacts() {
        let key = Key::new(EngineId(1), vec![0xAB; 4]);
        let debug = format!("{key:?}");
        assert!(!debug.contains("171"));
        assert!(debug.contains("len"));
    }
}

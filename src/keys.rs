// src/keys.rs

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::address_of;
use crate::types::Address;

const KEY_FILE_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const CIPHER_ALGORITHM: &str = "chacha20poly1305";
const KDF_ALGORITHM: &str = "argon2id";

/// Argon2id memory cost for new key files, in KiB.
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_ITERATIONS: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key i/o at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("malformed key file {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("key {0} not found")]
    NotFound(String),
    #[error("wrong passphrase for key {0}")]
    BadPassphrase(String),
    #[error("key file {0} does not match its recorded address")]
    Corrupt(String),
    #[error("unsupported key file {name}: {reason}")]
    Unsupported { name: String, reason: String },
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

impl From<argon2::Error> for KeyError {
    fn from(e: argon2::Error) -> Self {
        KeyError::Kdf(e.to_string())
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
struct KdfParams {
    algorithm: String,
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
    #[serde_as(as = "Hex")]
    salt: [u8; SALT_LEN],
}

#[serde_as]
#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    address: Address,
    cipher: String,
    kdf: KdfParams,
    #[serde_as(as = "Hex")]
    nonce: [u8; NONCE_LEN],
    /// Encrypted 32-byte secret seed; the address is bound as associated data.
    #[serde_as(as = "Hex")]
    ciphertext: Vec<u8>,
}

fn derive_key(pass: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))?;
    let mut out = Zeroizing::new([0u8; 32]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params).hash_password_into(
        pass.as_bytes(),
        &kdf.salt,
        &mut out[..],
    )?;
    Ok(out)
}

/// Directory of named signing keys, each encrypted under its passphrase.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
    kdf_memory_kib: u32,
}

impl KeyStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| KeyError::Io { path: dir.clone(), source })?;
        Ok(Self { dir, kdf_memory_kib: DEFAULT_KDF_MEMORY_KIB })
    }

    /// Memory cost used for keys written from now on. Existing files keep
    /// the cost they were written with.
    pub fn with_kdf_memory(mut self, kib: u32) -> Self {
        self.kdf_memory_kib = kib;
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn create(&self, name: &str, pass: &str) -> Result<SigningKey, KeyError> {
        let key = SigningKey::generate(&mut OsRng);
        self.store(name, pass, &key)?;
        info!(name, address = %address_of(&key).short(), "created key");
        Ok(key)
    }

    /// Writes `key` under `name`, replacing any previous file.
    pub fn store(&self, name: &str, pass: &str, key: &SigningKey) -> Result<(), KeyError> {
        let path = self.path(name);
        let address = address_of(key);

        let mut kdf = KdfParams {
            algorithm: KDF_ALGORITHM.to_string(),
            memory_kib: self.kdf_memory_kib,
            iterations: KDF_ITERATIONS,
            parallelism: KDF_PARALLELISM,
            salt: [0; SALT_LEN],
        };
        OsRng.fill_bytes(&mut kdf.salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sym = derive_key(pass, &kdf)?;
        let secret = Zeroizing::new(key.to_bytes());
        let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&sym[..]))
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &secret[..], aad: address.as_bytes() })
            .map_err(|e| KeyError::Kdf(e.to_string()))?;

        let file = KeyFile {
            version: KEY_FILE_VERSION,
            address,
            cipher: CIPHER_ALGORITHM.to_string(),
            kdf,
            nonce,
            ciphertext,
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|source| KeyError::Json { path: path.clone(), source })?;
        fs::write(&path, bytes).map_err(|source| KeyError::Io { path, source })
    }

    pub fn load(&self, name: &str, pass: &str) -> Result<SigningKey, KeyError> {
        let path = self.path(name);
        if !path.exists() {
            return Err(KeyError::NotFound(name.to_string()));
        }
        let bytes = fs::read(&path).map_err(|source| KeyError::Io { path: path.clone(), source })?;
        let file: KeyFile =
            serde_json::from_slice(&bytes).map_err(|source| KeyError::Json { path, source })?;

        let unsupported = |reason: String| KeyError::Unsupported { name: name.to_string(), reason };
        if file.version != KEY_FILE_VERSION {
            return Err(unsupported(format!("version {}", file.version)));
        }
        if file.cipher != CIPHER_ALGORITHM {
            return Err(unsupported(format!("cipher {}", file.cipher)));
        }
        if file.kdf.algorithm != KDF_ALGORITHM {
            return Err(unsupported(format!("kdf {}", file.kdf.algorithm)));
        }

        let sym = derive_key(pass, &file.kdf)?;
        // a wrong passphrase and a tampered file both fail authentication
        let plain = Zeroizing::new(
            ChaCha20Poly1305::new(Key::from_slice(&sym[..]))
                .decrypt(
                    Nonce::from_slice(&file.nonce),
                    Payload { msg: &file.ciphertext, aad: file.address.as_bytes() },
                )
                .map_err(|_| KeyError::BadPassphrase(name.to_string()))?,
        );
        let secret: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Corrupt(name.to_string()))?;
        let key = SigningKey::from_bytes(&secret);
        if address_of(&key) != file.address {
            return Err(KeyError::Corrupt(name.to_string()));
        }
        Ok(key)
    }

    pub fn load_or_create(&self, name: &str, pass: &str) -> Result<SigningKey, KeyError> {
        if self.exists(name) {
            self.load(name, pass)
        } else {
            self.create(name, pass)
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> KeyStore {
        KeyStore::open(dir).unwrap().with_kdf_memory(64)
    }

    #[test]
    fn created_key_reloads_with_same_address() {
        let dir = tempfile::tempdir().unwrap();
        let ks = store(dir.path());
        let k1 = ks.load_or_create("authority", "pw").unwrap();
        let k2 = ks.load_or_create("authority", "pw").unwrap();
        assert_eq!(address_of(&k1), address_of(&k2));
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ks = store(dir.path());
        ks.create("authority", "right").unwrap();
        assert!(matches!(ks.load("authority", "wrong"), Err(KeyError::BadPassphrase(_))));
        assert!(matches!(ks.load("nobody", "right"), Err(KeyError::NotFound(_))));
    }

    #[test]
    fn secret_is_not_stored_in_clear() {
        let dir = tempfile::tempdir().unwrap();
        let ks = store(dir.path());
        let key = ks.create("authority", "pw").unwrap();

        let raw = fs::read_to_string(dir.path().join("authority.key")).unwrap();
        assert!(!raw.contains(&hex::encode(key.to_bytes())));
        let file: KeyFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(file.kdf.memory_kib, 64);
        assert_eq!(file.kdf.algorithm, "argon2id");
    }

    #[test]
    fn tampered_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let ks = store(dir.path());
        ks.create("authority", "pw").unwrap();

        let path = dir.path().join("authority.key");
        let mut file: KeyFile = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        file.address = Address([7; 32]);
        fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
        assert!(matches!(ks.load("authority", "pw"), Err(KeyError::BadPassphrase(_))));
    }
}

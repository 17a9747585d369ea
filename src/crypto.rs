//src/crypto.rs

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::codec::{block_bytes, block_signing_bytes, tx_bytes, tx_signing_bytes};
use crate::types::{Address, Block, Hash, Transaction};

pub fn hash_bytes_sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn verify_ed25519(pubkey: &[u8; 32], sig_bytes: &[u8; 64], msg: &[u8]) -> bool {
    // VerifyingKey is fallible
    let pk = match VerifyingKey::from_bytes(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = Signature::from_bytes(sig_bytes);
    pk.verify(msg, &sig).is_ok()
}

pub fn address_of(key: &SigningKey) -> Address {
    Address(key.verifying_key().to_bytes())
}

pub fn tx_hash(tx: &Transaction) -> Hash {
    hash_bytes_sha256(&tx_bytes(tx))
}

pub fn block_hash(b: &Block) -> Hash {
    hash_bytes_sha256(&block_bytes(b))
}

/// Signs in place; `tx.from` is overwritten with the signer's address.
pub fn sign_tx(key: &SigningKey, mut tx: Transaction) -> Transaction {
    tx.from = address_of(key);
    tx.signature = key.sign(&tx_signing_bytes(&tx)).to_bytes();
    tx
}

pub fn verify_tx(tx: &Transaction) -> bool {
    verify_ed25519(tx.from.as_bytes(), &tx.signature, &tx_signing_bytes(tx))
}

pub fn sign_block(key: &SigningKey, mut b: Block) -> Block {
    b.signature = key.sign(&block_signing_bytes(&b)).to_bytes();
    b
}

pub fn verify_block(b: &Block, authority: &Address) -> bool {
    verify_ed25519(authority.as_bytes(), &b.signature, &block_signing_bytes(b))
}

/// Deterministic keys for tests, demos and property strategies.
pub mod test_keys {
    use super::*;

    pub fn key_from_seed(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub fn transfer(from: &SigningKey, to: Address, value: u64, nonce: u64) -> Transaction {
        sign_tx(from, Transaction::new(address_of(from), to, value, nonce))
    }
}

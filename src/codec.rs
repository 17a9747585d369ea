// src/codec.rs

use crate::types::{Block, Transaction};

pub const CODEC_VERSION: u8 = 1;
pub const DOM_TX: &[u8] = b"TX";
pub const DOM_BLOCK: &[u8] = b"BLK";

// --- helpers: write primitives deterministically ---

pub fn put_u64(dst: &mut Vec<u8>, x: u64) {
    dst.extend_from_slice(&x.to_le_bytes());
}

pub fn put_u32(v: &mut Vec<u8>, x: u32) {
    v.extend_from_slice(&x.to_le_bytes());
}

pub fn put_bytes(v: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(v, bytes.len() as u32);
    v.extend_from_slice(bytes);
}

// --- public encoders used for hashing and signing ---

/// Bytes covered by the sender's signature.
pub fn tx_signing_bytes(tx: &Transaction) -> Vec<u8> {
    let mut v = Vec::with_capacity(1 + DOM_TX.len() + 32 + 32 + 8 + 8);
    v.push(CODEC_VERSION);
    v.extend_from_slice(DOM_TX);
    v.extend_from_slice(tx.from.as_bytes());
    v.extend_from_slice(tx.to.as_bytes());
    put_u64(&mut v, tx.value);
    put_u64(&mut v, tx.nonce);
    v
}

/// Full canonical encoding; the transaction identity is the hash of this.
pub fn tx_bytes(tx: &Transaction) -> Vec<u8> {
    let mut v = tx_signing_bytes(tx);
    v.extend_from_slice(&tx.signature);
    v
}

/// Bytes covered by the authority's block signature.
pub fn block_signing_bytes(b: &Block) -> Vec<u8> {
    let mut v = vec![CODEC_VERSION];
    v.extend_from_slice(DOM_BLOCK);
    put_u64(&mut v, b.number);
    v.extend_from_slice(&b.parent);
    put_u32(&mut v, b.transactions.len() as u32);
    for tx in &b.transactions {
        put_bytes(&mut v, &tx_bytes(tx));
    }
    v
}

pub fn block_bytes(b: &Block) -> Vec<u8> {
    let mut v = block_signing_bytes(b);
    v.extend_from_slice(&b.signature);
    v
}

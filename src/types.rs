// src/types.rs

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, DeserializeFromStr, SerializeDisplay};

pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

/// Account identifier: the 32-byte ed25519 verifying key of the account.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, SerializeDisplay, DeserializeFromStr)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 7 hex chars, the way log lines abbreviate accounts and hashes.
    pub fn short(&self) -> String {
        short_hex(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AddressParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("address must be 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressParseError::Length(bytes.len()))?;
        Ok(Address(arr))
    }
}

pub fn short_hex(bytes: &[u8]) -> String {
    let mut s = hex::encode(bytes);
    s.truncate(7);
    s
}

/// Network address (`host:port`) of a known node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Peer(String);

impl Peer {
    pub fn new(addr: impl Into<String>) -> Self {
        Peer(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({})", self.0)
    }
}

impl From<&str> for Peer {
    fn from(s: &str) -> Self {
        Peer::new(s)
    }
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub value: u64,
    pub nonce: u64,
    #[serde_as(as = "Hex")]
    pub signature: [u8; 64],
}

impl Transaction {
    /// Unsigned transaction; see `crypto::sign_tx`.
    pub fn new(from: Address, to: Address, value: u64, nonce: u64) -> Self {
        Self { from, to, value, nonce, signature: [0u8; 64] }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("from", &self.from.short())
            .field("to", &self.to.short())
            .field("value", &self.value)
            .field("nonce", &self.nonce)
            .finish()
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    #[serde_as(as = "Hex")]
    pub parent: Hash,
    pub transactions: Vec<Transaction>,
    #[serde_as(as = "Hex")]
    pub signature: [u8; 64],
}

impl Block {
    /// Unsigned block; the authority signs it with `crypto::sign_block`.
    pub fn new(number: u64, parent: Hash, transactions: Vec<Transaction>) -> Self {
        Self { number, parent, transactions, signature: [0u8; 64] }
    }

    /// Block 0: zero parent, no transactions, never signed or applied.
    pub fn genesis() -> Self {
        Self::new(0, ZERO_HASH, Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub chain: String,
    pub authority: Address,
    pub balances: BTreeMap<Address, u64>,
}

impl Genesis {
    pub fn new(chain: impl Into<String>, authority: Address) -> Self {
        Self { chain: chain.into(), authority, balances: BTreeMap::new() }
    }

    pub fn with_balance(mut self, who: Address, amount: u64) -> Self {
        self.balances.insert(who, amount);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountView {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    NewPendingTx(Transaction),
    NewBlock(Block),
}

// src/state.rs

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::crypto::{block_hash, tx_hash, verify_block, verify_tx};
use crate::store::StoreError;
use crate::types::{short_hex, AccountView, Address, Block, Genesis, Hash, Transaction};

pub type Balances = HashMap<Address, u64>;
pub type Nonces = HashMap<Address, u64>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("insufficient funds: balance {balance}, value {value}")]
    InsufficientFunds { balance: u64, value: u64 },
    #[error("recipient balance overflow")]
    BalanceOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("invalid block number: expected {expected}, got {got}")]
    InvalidBlockNumber { expected: u64, got: u64 },
    #[error("invalid parent hash: expected {}, got {}", short_hex(.expected), short_hex(.got))]
    InvalidParentHash { expected: Hash, got: Hash },
    #[error("block not signed by the chain authority")]
    InvalidBlockSignature,
    #[error("tx {}: {source}", short_hex(.hash))]
    Tx { hash: Hash, source: TxError },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("block {number}: {source}")]
    Block { number: u64, source: BlockError },
}

/// Balances and nonces, the part of the ledger transactions mutate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accounts {
    balances: Balances,
    nonces: Nonces,
}

impl Accounts {
    pub fn from_genesis(genesis: &Genesis) -> Self {
        Self {
            balances: genesis.balances.iter().map(|(a, b)| (*a, *b)).collect(),
            nonces: Nonces::new(),
        }
    }

    pub fn balance(&self, who: &Address) -> u64 {
        *self.balances.get(who).unwrap_or(&0)
    }

    pub fn nonce(&self, who: &Address) -> u64 {
        *self.nonces.get(who).unwrap_or(&0)
    }

    pub fn balances(&self) -> &Balances {
        &self.balances
    }

    pub fn nonces(&self) -> &Nonces {
        &self.nonces
    }

    pub fn account(&self, who: &Address) -> AccountView {
        AccountView { address: *who, balance: self.balance(who), nonce: self.nonce(who) }
    }

    /// Validation only: signature, nonce, funds, recipient overflow, in that order.
    pub fn check_tx(&self, tx: &Transaction) -> Result<(), TxError> {
        if !verify_tx(tx) {
            return Err(TxError::InvalidSignature);
        }
        let expected = self.nonce(&tx.from) + 1;
        if tx.nonce != expected {
            return Err(TxError::InvalidNonce { expected, got: tx.nonce });
        }
        let balance = self.balance(&tx.from);
        if balance < tx.value {
            return Err(TxError::InsufficientFunds { balance, value: tx.value });
        }
        if tx.from != tx.to && self.balance(&tx.to).checked_add(tx.value).is_none() {
            return Err(TxError::BalanceOverflow);
        }
        Ok(())
    }

    pub fn apply_tx(&mut self, tx: &Transaction) -> Result<(), TxError> {
        self.check_tx(tx)?;
        *self.balances.entry(tx.from).or_insert(0) -= tx.value;
        *self.balances.entry(tx.to).or_insert(0) += tx.value;
        *self.nonces.entry(tx.from).or_insert(0) += 1;
        Ok(())
    }
}

/// Speculative view: committed accounts plus the not-yet-committed pool.
#[derive(Debug, Clone, Default)]
pub struct Pending {
    accounts: Accounts,
    txs: HashMap<Hash, Transaction>,
}

impl Pending {
    fn derive(committed: &Accounts) -> Self {
        Self { accounts: committed.clone(), txs: HashMap::new() }
    }

    pub fn apply_tx(&mut self, tx: &Transaction) -> Result<Hash, TxError> {
        self.accounts.apply_tx(tx)?;
        let hash = tx_hash(tx);
        self.txs.insert(hash, tx.clone());
        Ok(hash)
    }

    pub fn accounts(&self) -> &Accounts {
        &self.accounts
    }

    pub fn balance(&self, who: &Address) -> u64 {
        self.accounts.balance(who)
    }

    pub fn nonce(&self, who: &Address) -> u64 {
        self.accounts.nonce(who)
    }

    pub fn account(&self, who: &Address) -> AccountView {
        self.accounts.account(who)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    pub fn txs(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.values()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

/// Output of `Ledger::create_block`: the unsigned block and what was left out.
#[derive(Debug, Clone)]
pub struct CreatedBlock {
    pub block: Block,
    pub dropped: Vec<(Hash, TxError)>,
}

/// Committed ledger plus its pending overlay.
///
/// `Clone` is a deep, independent copy; it is how block application and
/// history replay stay atomic: apply to a clone, then `apply` it back.
#[derive(Debug, Clone)]
pub struct Ledger {
    authority: Address,
    accounts: Accounts,
    last_block: Block,
    last_hash: Hash,
    applied: HashSet<Hash>,
    pending: Pending,
}

impl Ledger {
    pub fn new(genesis: &Genesis) -> Self {
        let accounts = Accounts::from_genesis(genesis);
        let last_block = Block::genesis();
        let last_hash = block_hash(&last_block);
        let pending = Pending::derive(&accounts);
        Self {
            authority: genesis.authority,
            accounts,
            last_block,
            last_hash,
            applied: HashSet::new(),
            pending,
        }
    }

    pub fn authority(&self) -> &Address {
        &self.authority
    }

    pub fn accounts(&self) -> &Accounts {
        &self.accounts
    }

    pub fn balance(&self, who: &Address) -> u64 {
        self.accounts.balance(who)
    }

    pub fn nonce(&self, who: &Address) -> u64 {
        self.accounts.nonce(who)
    }

    pub fn account(&self, who: &Address) -> AccountView {
        self.accounts.account(who)
    }

    pub fn last_block(&self) -> &Block {
        &self.last_block
    }

    pub fn last_hash(&self) -> Hash {
        self.last_hash
    }

    pub fn is_applied(&self, hash: &Hash) -> bool {
        self.applied.contains(hash)
    }

    pub fn pending(&self) -> &Pending {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut Pending {
        &mut self.pending
    }

    /// Applies to the committed view. Nothing changes on error.
    pub fn apply_tx(&mut self, tx: &Transaction) -> Result<(), TxError> {
        self.accounts.apply_tx(tx)?;
        self.applied.insert(tx_hash(tx));
        Ok(())
    }

    /// Orders the pending pool by `(from, nonce)` and replays it on top of
    /// the committed accounts, leaving out whatever no longer validates.
    pub fn create_block(&self) -> CreatedBlock {
        let mut pool: Vec<(Hash, &Transaction)> =
            self.pending.txs.iter().map(|(h, tx)| (*h, tx)).collect();
        pool.sort_by(|(ha, a), (hb, b)| (a.from, a.nonce, ha).cmp(&(b.from, b.nonce, hb)));

        let mut scratch = self.accounts.clone();
        let mut txs = Vec::with_capacity(pool.len());
        let mut dropped = Vec::new();
        for (hash, tx) in pool {
            match scratch.apply_tx(tx) {
                Ok(()) => txs.push(tx.clone()),
                Err(e) => {
                    warn!(tx = %short_hex(&hash), error = %e, "dropping pending tx from block");
                    dropped.push((hash, e));
                }
            }
        }

        let block = Block::new(self.last_block.number + 1, self.last_hash, txs);
        CreatedBlock { block, dropped }
    }

    /// All-or-nothing: on any error the committed view is untouched.
    pub fn apply_block(&mut self, block: &Block) -> Result<(), BlockError> {
        let expected = self.last_block.number + 1;
        if block.number != expected {
            return Err(BlockError::InvalidBlockNumber { expected, got: block.number });
        }
        if block.parent != self.last_hash {
            return Err(BlockError::InvalidParentHash { expected: self.last_hash, got: block.parent });
        }
        if !verify_block(block, &self.authority) {
            return Err(BlockError::InvalidBlockSignature);
        }

        let mut scratch = self.accounts.clone();
        let mut hashes = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let hash = tx_hash(tx);
            scratch
                .apply_tx(tx)
                .map_err(|source| BlockError::Tx { hash, source })?;
            hashes.push(hash);
        }

        self.accounts = scratch;
        self.applied.extend(hashes);
        self.last_block = block.clone();
        self.last_hash = block_hash(block);
        Ok(())
    }

    /// Replaces the committed view with `other`'s. Pending is left alone;
    /// callers follow up with `reset_pending`.
    pub fn apply(&mut self, other: Ledger) {
        self.accounts = other.accounts;
        self.applied = other.applied;
        self.last_block = other.last_block;
        self.last_hash = other.last_hash;
    }

    pub fn reset_pending(&mut self) {
        self.pending = Pending::derive(&self.accounts);
    }

    /// Clone, apply, commit, reset: the one path that advances committed state.
    pub fn commit_block(&mut self, block: &Block) -> Result<(), BlockError> {
        let mut next = self.clone();
        next.apply_block(block)?;
        self.apply(next);
        self.reset_pending();
        Ok(())
    }

    /// Replays history in order. Stops at the first bad block; everything
    /// before it stays committed. Returns the number of blocks applied.
    pub fn read_blocks<I>(&mut self, blocks: I) -> Result<u64, ReplayError>
    where
        I: IntoIterator<Item = Result<Block, StoreError>>,
    {
        let mut applied = 0;
        for block in blocks {
            let block = block?;
            self.commit_block(&block)
                .map_err(|source| ReplayError::Block { number: block.number, source })?;
            applied += 1;
        }
        Ok(applied)
    }
}

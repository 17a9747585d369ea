// src/store.rs

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::types::{Block, Genesis};

const GENESIS_FILE: &str = "genesis.json";
const BLOCKS_DIR: &str = "blocks";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("malformed json in {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("genesis already exists at {0}")]
    GenesisExists(PathBuf),
    #[error("block {0} already stored")]
    Exists(u64),
    #[error("block history has a gap: expected block {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

/// Append-only history: `genesis.json` plus one JSON file per block,
/// named by zero-padded block number so directory order is replay order.
#[derive(Debug, Clone)]
pub struct BlockStore {
    root: PathBuf,
}

impl BlockStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let blocks = root.join(BLOCKS_DIR);
        fs::create_dir_all(&blocks).map_err(io_err(&blocks))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn genesis_path(&self) -> PathBuf {
        self.root.join(GENESIS_FILE)
    }

    fn block_path(&self, number: u64) -> PathBuf {
        self.root.join(BLOCKS_DIR).join(format!("{number:016}.json"))
    }

    pub fn read_genesis(&self) -> Result<Option<Genesis>, StoreError> {
        let path = self.genesis_path();
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn write_genesis(&self, genesis: &Genesis) -> Result<(), StoreError> {
        let path = self.genesis_path();
        if path.exists() {
            return Err(StoreError::GenesisExists(path));
        }
        write_json(&path, genesis)
    }

    /// Stored block numbers in ascending order.
    fn numbers(&self) -> Result<Vec<u64>, StoreError> {
        let dir = self.root.join(BLOCKS_DIR);
        let mut numbers = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(n) = stem.parse::<u64>() {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    pub fn last_number(&self) -> Result<u64, StoreError> {
        Ok(self.numbers()?.last().copied().unwrap_or(0))
    }

    pub fn has_history(&self) -> Result<bool, StoreError> {
        Ok(self.genesis_path().exists())
    }

    /// Appends the next block. Refuses overwrites and gaps.
    pub fn write_block(&self, block: &Block) -> Result<(), StoreError> {
        let path = self.block_path(block.number);
        if path.exists() {
            return Err(StoreError::Exists(block.number));
        }
        // only the predecessor is checked; a full scan is left for the error path
        let has_parent = match block.number {
            0 => false,
            1 => true,
            n => self.block_path(n - 1).exists(),
        };
        if !has_parent {
            let expected = self.last_number()? + 1;
            return Err(StoreError::Gap { expected, found: block.number });
        }
        write_json(&path, block)
    }

    /// Full history in replay order. Each block is read lazily; a gap in
    /// numbering surfaces as an error at the point it occurs.
    pub fn read_blocks(&self) -> Result<impl Iterator<Item = Result<Block, StoreError>> + '_, StoreError> {
        let numbers = self.numbers()?;
        Ok(numbers.into_iter().enumerate().map(move |(i, n)| {
            let expected = i as u64 + 1;
            if n != expected {
                return Err(StoreError::Gap { expected, found: n });
            }
            read_json(&self.block_path(n))
        }))
    }

    /// Up to `limit` blocks starting at `from`, for peers catching up.
    pub fn blocks_from(&self, from: u64, limit: usize) -> Result<Vec<Block>, StoreError> {
        let from = from.max(1);
        let mut out = Vec::new();
        for n in from.. {
            if out.len() >= limit {
                break;
            }
            let path = self.block_path(n);
            if !path.exists() {
                break;
            }
            out.push(read_json(&path)?);
        }
        Ok(out)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path: path.to_path_buf(), source })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|source| StoreError::Json { path: path.to_path_buf(), source })?;
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        f.write_all(&bytes).map_err(io_err(&tmp))?;
        f.sync_all().map_err(io_err(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))
}

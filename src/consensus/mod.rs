// src/consensus/mod.rs
//
// Single-authority block production: no voting, the genesis authority's key
// is the only one whose blocks apply.

pub mod proposer;

pub use proposer::{BlockProposer, ProposerConfig, ProposerNode};

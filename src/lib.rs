// src/lib.rs
pub mod types;
pub mod codec;
pub mod crypto;
pub mod state;
pub mod store;
pub mod keys;
pub mod config;
pub mod events;
pub mod p2p;
pub mod relay;
pub mod discovery;
pub mod sync;
pub mod consensus;
pub mod node;
pub mod rpc;

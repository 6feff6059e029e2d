// Storage - Persistence layer (key/value store + Merkle-committed tries)
// Principle: every committed view is reopenable from its root

pub mod kv;
pub mod db;
pub mod trie;
pub mod state;

pub use kv::*;
pub use db::*;
pub use trie::*;
pub use state::*;

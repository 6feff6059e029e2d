// Types - Chain data model
// Principle: fixed-width identifiers, hashes computed from content only

pub mod primitives;
pub mod signature;
pub mod account;
pub mod transaction;
pub mod block;

pub use primitives::*;
pub use signature::*;
pub use account::*;
pub use transaction::*;
pub use block::*;

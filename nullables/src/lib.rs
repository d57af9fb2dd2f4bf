//! Nullable infrastructure for deterministic testing.
//!
//! Every external dependency of the saga (clock, storage, peer transport,
//! chain node, scope lookup, search) sits behind a trait. This crate provides
//! implementations that:
//! - return deterministic values
//! - can be scripted and inspected programmatically
//! - never touch the filesystem or network
//!
//! Usage: swap real implementations for nullables in tests.

pub mod chain;
pub mod clock;
pub mod peer;
pub mod scope;
pub mod search;
pub mod store;

pub use chain::{NullChainNode, NullSubmitter};
pub use clock::NullClock;
pub use peer::{NullPeer, PeerCall};
pub use scope::NullScopeLookup;
pub use search::{IndexedDocument, NullFieldExtractor, NullSearchIndex};
pub use store::NullStore;

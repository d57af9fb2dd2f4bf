//! Narrow interfaces to everything the saga does not implement itself: the
//! peer transport, chain submission and query, scope lookup, and search.
//!
//! Every collaborator reports failures through [`CollabError`], whose kind
//! tells the caller whether to wait for a re-trigger, record a business
//! error, or abort.

pub mod chain;
pub mod error;
pub mod peer;
pub mod scope;
pub mod search;

pub use chain::{
    BlockRange, ChainEvent, ChainNode, NewBlock, StreamBlock, TransactionSubmitter, TxReceipt,
    TxResult,
};
pub use error::{CollabError, CollabErrorKind};
pub use peer::PeerDelivery;
pub use scope::ScopeLookup;
pub use search::{FieldExtractor, SearchDocument, SearchIndex};

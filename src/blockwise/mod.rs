//! Blockwise transfers (RFC 7959) with BERT bulking for reliable
//! transports (RFC 8323 §6).
//!
//! The layer sits between an upper layer (application, observe handling,
//! matcher) and a lower layer (message codec, transport). It fragments
//! outbound bodies, reassembles inbound ones, serialises concurrent
//! transfers per `(peer, token, resource)` key, serves random block
//! access, and garbage-collects abandoned transfers.
//!
//! With BERT, a single on-wire block carries several 1024-byte sub-blocks
//! at once while staying wire-compatible with plain RFC 7959 peers; the
//! `bulk_blocks` configuration controls how many.
//!
//! The block option codec and the transfer key are plain `alloc` code and
//! always available; the stateful machinery (statuses, registry, layer)
//! requires the `std` feature.

mod key;
mod value;

#[cfg(feature = "std")]
mod layer;
#[cfg(feature = "std")]
mod registry;
#[cfg(feature = "std")]
mod status;

pub use key::TransferKey;
pub use value::{
    szx_for_size, BlockValue, BERT_SUB_BLOCK_SIZE, BERT_SZX,
};

#[cfg(feature = "std")]
pub use layer::{
    BlockwiseConfig, BlockwiseLayer, Exchange, LowerLayer, UpperLayer,
};
#[cfg(feature = "std")]
pub use status::{TransferEnd, TransferObserver};

//! Blockwise transfer (RFC 7959) with the BERT extension for reliable
//! transports (RFC 8323 §6), on top of a lightweight in-memory CoAP
//! message model.
//!
//! ## Overview
//! Oversized request and response payloads are fragmented into block
//! sequences and reassembled on the other side, so a single logical CoAP
//! exchange can span many on-wire messages without loss, duplication or
//! unbounded memory growth. On reliable transports the BERT size exponent
//! (`SZX=7`) additionally lets one message bulk several 1024-byte
//! sub-blocks.
//!
//! The [`blockwise::BlockwiseLayer`] is the entry point: it consumes the
//! surrounding stack through the [`blockwise::UpperLayer`] and
//! [`blockwise::LowerLayer`] contracts and keeps all transfer state in
//! memory. Message serialisation, request matching and the transport
//! itself stay with the endpoint.
//!
//! ## Usage
//! ```rust
//! use coap_bert::blockwise::{BlockValue, BERT_SZX};
//!
//! // Block2: sub-block 4 of a BERT transfer, more to follow.
//! let block = BlockValue::bert(4, true).unwrap();
//! assert_eq!(BERT_SZX, block.szx);
//! assert_eq!(4096, block.offset());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
extern crate alloc;

#[macro_use]
mod log;

pub mod error;

mod header;
mod option_value;
mod packet;
mod request;
mod response;

pub mod blockwise;

pub use header::{
    Header, MessageClass, MessageType, RequestType, ResponseType,
};
pub use option_value::{
    OptionValueString, OptionValueType, OptionValueU16, OptionValueU32,
    OptionValueU64, OptionValueU8,
};
pub use packet::{CoapOption, Packet};
pub use request::CoapRequest;
pub use response::CoapResponse;

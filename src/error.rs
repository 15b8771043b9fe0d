//! The errors of the `coap-bert` crate.

use alloc::string::{String, ToString};
use core::fmt;
#[cfg(feature = "std")]
use std::error;

use crate::ResponseType;

/// The error that can occur when decoding an option value into a structured
/// representation.
#[derive(Debug, Clone, PartialEq)]
pub struct IncompatibleOptionValueFormat {
    pub message: String,
}

impl fmt::Display for IncompatibleOptionValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "incompatible option value: {}", self.message)
    }
}

#[cfg(feature = "std")]
impl error::Error for IncompatibleOptionValueFormat {}

/// The errors that can occur when constructing a block option value.
#[derive(Debug, PartialEq)]
pub enum InvalidBlockValue {
    /// The block size is not one of the encodable powers of two.
    SizeNotEncodable(usize),
    /// The block number does not fit the 20 bits of the wire form.
    NumOverflow(u32),
    /// The size exponent is outside `0..=7`.
    SzxOutOfRange(u8),
}

impl fmt::Display for InvalidBlockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidBlockValue::SizeNotEncodable(size) => {
                write!(f, "block size {} cannot be encoded", size)
            }
            InvalidBlockValue::NumOverflow(num) => {
                write!(f, "block number {} exceeds 20 bits", num)
            }
            InvalidBlockValue::SzxOutOfRange(szx) => {
                write!(f, "size exponent {} outside 0..=7", szx)
            }
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for InvalidBlockValue {}

/// The error returned by the lower layer when a message could not be handed
/// to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SendError {
    pub reason: String,
}

impl SendError {
    pub fn new<T: ToString>(reason: T) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send failed: {}", self.reason)
    }
}

#[cfg(feature = "std")]
impl error::Error for SendError {}

/// A protocol failure detected while handling a block transfer, carrying the
/// response code to report to the peer.
///
/// Rather than sending the failure itself, the low-level machinery yields
/// this error and the caller converts it into an outbound message, typically
/// through [`crate::CoapRequest::apply_from_error`]. A `None` code means the
/// message must be dropped without a reply.
#[derive(Debug, Clone)]
pub struct HandlingError {
    pub code: Option<ResponseType>,
    pub message: String,
}

impl fmt::Display for HandlingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handling error {:?}: {}", self.code, self.message)
    }
}

#[cfg(feature = "std")]
impl error::Error for HandlingError {}

impl HandlingError {
    pub fn not_handled() -> Self {
        Self {
            code: None,
            message: "not handled".to_string(),
        }
    }

    /// 4.08, the peer sent a block out of sequence.
    pub fn wrong_block_number() -> Self {
        Self::with_code(
            ResponseType::RequestEntityIncomplete,
            "wrong block number",
        )
    }

    /// 4.08, a later block changed the Content-Format mid-transfer.
    pub fn content_format_mismatch() -> Self {
        Self::with_code(
            ResponseType::RequestEntityIncomplete,
            "unexpected Content-Format",
        )
    }

    /// 4.13, the assembled body outgrew the transfer's buffer.
    pub fn body_too_large() -> Self {
        Self::with_code(
            ResponseType::RequestEntityTooLarge,
            "body exceeded expected size",
        )
    }

    /// 4.13, the declared Size1 exceeds what we are willing to assemble.
    pub fn request_body_too_large(limit: usize) -> Self {
        Self::with_code(
            ResponseType::RequestEntityTooLarge,
            format!("request body larger than {} bytes", limit),
        )
    }

    /// 4.02, a random-access request addressed a block beyond the body.
    pub fn unknown_block(num: u32) -> Self {
        Self::with_code(
            ResponseType::BadOption,
            format!("no block {} in representation", num),
        )
    }

    /// 5.00, the resource implementation produced a block that disagrees
    /// with what the peer asked for.
    pub fn resource_impl_error<T: ToString>(e: T) -> Self {
        Self::with_code(ResponseType::InternalServerError, e)
    }

    pub fn internal<T: ToString>(e: T) -> Self {
        Self::with_code(ResponseType::InternalServerError, e)
    }

    pub fn with_code<T: ToString>(code: ResponseType, e: T) -> Self {
        Self {
            code: Some(code),
            message: e.to_string(),
        }
    }
}

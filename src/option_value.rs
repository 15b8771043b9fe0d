//! Convenience types for option values.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::convert::TryFrom;

use crate::error::IncompatibleOptionValueFormat;

/// Supertrait for types that can be used as option values.
pub trait OptionValueType:
    Into<Vec<u8>> + TryFrom<Vec<u8>, Error = IncompatibleOptionValueFormat>
{
}

/// Encodes an unsigned integer option value in the minimal-length
/// big-endian form of RFC 7252 §3.2 (zero encodes as the empty string).
pub(crate) fn uint_to_option(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes an unsigned integer option value of at most `max_len` bytes.
pub(crate) fn uint_from_option(
    encoded: &[u8],
    max_len: usize,
) -> Result<u64, IncompatibleOptionValueFormat> {
    if encoded.len() > max_len {
        return Err(IncompatibleOptionValueFormat {
            message: format!(
                "uint option of {} bytes, at most {} allowed",
                encoded.len(),
                max_len
            ),
        });
    }
    Ok(encoded.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b)))
}

macro_rules! option_value_uint_impl {
    ($struct_name:ident, $type:ty, $bytes:expr) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $struct_name(pub $type);

        impl From<$struct_name> for Vec<u8> {
            fn from(value: $struct_name) -> Self {
                uint_to_option(value.0.into())
            }
        }

        impl TryFrom<Vec<u8>> for $struct_name {
            type Error = IncompatibleOptionValueFormat;

            fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
                // The length check above makes the narrowing cast lossless.
                uint_from_option(&value, $bytes)
                    .map(|wide| $struct_name(wide as $type))
            }
        }

        impl OptionValueType for $struct_name {}
    };
}

option_value_uint_impl!(OptionValueU8, u8, 1);
option_value_uint_impl!(OptionValueU16, u16, 2);
option_value_uint_impl!(OptionValueU32, u32, 4);
option_value_uint_impl!(OptionValueU64, u64, 8);

#[derive(Debug, Clone, PartialEq)]
pub struct OptionValueString(pub String);

impl From<OptionValueString> for Vec<u8> {
    fn from(option_value: OptionValueString) -> Self {
        option_value.0.into_bytes()
    }
}

impl TryFrom<Vec<u8>> for OptionValueString {
    type Error = IncompatibleOptionValueFormat;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        String::from_utf8(value).map(OptionValueString).map_err(|e| {
            IncompatibleOptionValueFormat {
                message: e.to_string(),
            }
        })
    }
}

impl OptionValueType for OptionValueString {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uint_minimal_encoding() {
        assert_eq!(Vec::<u8>::new(), uint_to_option(0));
        assert_eq!(vec![0x2A], uint_to_option(42));
        assert_eq!(vec![0x01, 0x00], uint_to_option(256));
        assert_eq!(vec![0x12, 0x34, 0x56], uint_to_option(0x12_3456));
    }

    #[test]
    fn uint_roundtrip() {
        for value in [0u32, 1, 255, 256, 65_535, 65_536, u32::MAX] {
            let encoded: Vec<u8> = OptionValueU32(value).into();
            let decoded = OptionValueU32::try_from(encoded).unwrap();
            assert_eq!(value, decoded.0);
        }
    }

    #[test]
    fn uint_overflow_rejected() {
        let err = OptionValueU16::try_from(vec![1, 2, 3]).unwrap_err();
        assert!(err.message.contains("at most 2"));
    }

    #[test]
    fn string_roundtrip() {
        let encoded: Vec<u8> =
            OptionValueString("sensors/temp".to_string()).into();
        let decoded = OptionValueString::try_from(encoded).unwrap();
        assert_eq!("sensors/temp", decoded.0);
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        assert!(OptionValueString::try_from(vec![0xFE, 0xFF]).is_err());
    }
}

use alloc::vec::Vec;
use core::convert::TryFrom;
use core::fmt;

use crate::error::{IncompatibleOptionValueFormat, InvalidBlockValue};
use crate::option_value::{uint_from_option, uint_to_option, OptionValueType};

/// The size exponent RFC 8323 §6 reserves for BERT: the payload is a
/// concatenation of 1024-byte sub-blocks and NUM counts in units of 1024.
pub const BERT_SZX: u8 = 7;

/// The sub-block unit of a BERT payload.
pub const BERT_SUB_BLOCK_SIZE: usize = 1024;

/// NUM travels in the upper bits of an at most 3-byte option value.
const MAX_NUM: u32 = (1 << 20) - 1;

/// The Block1/Block2 option value `(NUM, M, SZX)` of RFC 7959 §2.1.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockValue {
    /// Creates a block value, validating the `NUM` and `SZX` ranges.
    pub fn new(
        num: u32,
        more: bool,
        szx: u8,
    ) -> Result<Self, InvalidBlockValue> {
        if szx > BERT_SZX {
            return Err(InvalidBlockValue::SzxOutOfRange(szx));
        }
        if num > MAX_NUM {
            return Err(InvalidBlockValue::NumOverflow(num));
        }
        Ok(Self { num, more, szx })
    }

    /// Creates a block value for a concrete block size, picking the largest
    /// encodable size not in excess of `size`.
    pub fn with_size(
        num: u32,
        more: bool,
        size: usize,
    ) -> Result<Self, InvalidBlockValue> {
        Self::new(num, more, szx_for_size(size)?)
    }

    /// Creates a BERT block value.
    pub fn bert(num: u32, more: bool) -> Result<Self, InvalidBlockValue> {
        Self::new(num, more, BERT_SZX)
    }

    pub fn is_bert(&self) -> bool {
        self.szx == BERT_SZX
    }

    /// The block size for `SZX <= 6`. Undefined on the wire for BERT, where
    /// the payload length itself determines the effective size.
    pub fn size(&self) -> Option<usize> {
        if self.is_bert() {
            None
        } else {
            Some(1 << (self.szx + 4))
        }
    }

    /// The unit `NUM` counts in: the block size for `SZX <= 6`, 1024 for
    /// BERT.
    pub fn stride(&self) -> usize {
        if self.is_bert() {
            BERT_SUB_BLOCK_SIZE
        } else {
            1 << (self.szx + 4)
        }
    }

    /// The byte offset into the body this block starts at.
    pub fn offset(&self) -> usize {
        self.num as usize * self.stride()
    }
}

impl fmt::Display for BlockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.num,
            if self.more { "M" } else { "-" },
            self.szx
        )
    }
}

/// Maps a byte count to the largest encodable size exponent whose block
/// size does not exceed it. BERT is never inferred from a size.
pub fn szx_for_size(size: usize) -> Result<u8, InvalidBlockValue> {
    if size < 16 {
        return Err(InvalidBlockValue::SizeNotEncodable(size));
    }
    let exponent = usize::BITS - 1 - size.leading_zeros();
    Ok((exponent.min(10) - 4) as u8)
}

impl From<BlockValue> for Vec<u8> {
    fn from(block: BlockValue) -> Vec<u8> {
        let scalar = u64::from(block.num) << 4
            | u64::from(block.more) << 3
            | u64::from(block.szx & 0x7);
        uint_to_option(scalar)
    }
}

impl TryFrom<Vec<u8>> for BlockValue {
    type Error = IncompatibleOptionValueFormat;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let scalar = uint_from_option(&value, 3)?;
        Ok(Self {
            num: (scalar >> 4) as u32,
            more: scalar >> 3 & 0x1 == 0x1,
            szx: (scalar & 0x7) as u8,
        })
    }
}

impl OptionValueType for BlockValue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for num in [0u32, 1, 2, 15, 16, 255, 4096, 99_999, MAX_NUM] {
            for szx in 0..=BERT_SZX {
                for more in [false, true] {
                    let block = BlockValue::new(num, more, szx).unwrap();
                    let encoded: Vec<u8> = block.clone().into();
                    assert!(encoded.len() <= 3);
                    let decoded = BlockValue::try_from(encoded).unwrap();
                    assert_eq!(block, decoded);
                }
            }
        }
    }

    #[test]
    fn zero_value_encodes_empty() {
        let block = BlockValue::new(0, false, 0).unwrap();
        let encoded: Vec<u8> = block.into();
        assert!(encoded.is_empty());
    }

    #[test]
    fn oversized_wire_value_rejected() {
        assert!(BlockValue::try_from(vec![1, 2, 3, 4]).is_err());
    }

    #[test]
    fn num_range_checked() {
        assert!(BlockValue::new(MAX_NUM, true, 6).is_ok());
        assert_eq!(
            Err(InvalidBlockValue::NumOverflow(MAX_NUM + 1)),
            BlockValue::new(MAX_NUM + 1, true, 6)
        );
        assert_eq!(
            Err(InvalidBlockValue::SzxOutOfRange(8)),
            BlockValue::new(0, false, 8)
        );
    }

    #[test]
    fn size_and_stride() {
        let plain = BlockValue::new(3, true, 6).unwrap();
        assert_eq!(Some(1024), plain.size());
        assert_eq!(1024, plain.stride());
        assert_eq!(3072, plain.offset());

        let bert = BlockValue::bert(8, false).unwrap();
        assert_eq!(None, bert.size());
        assert_eq!(BERT_SUB_BLOCK_SIZE, bert.stride());
        assert_eq!(8192, bert.offset());

        let tiny = BlockValue::new(0, false, 0).unwrap();
        assert_eq!(Some(16), tiny.size());
    }

    #[test]
    fn szx_from_size() {
        assert_eq!(Err(InvalidBlockValue::SizeNotEncodable(0)), szx_for_size(0));
        assert_eq!(Err(InvalidBlockValue::SizeNotEncodable(15)), szx_for_size(15));
        assert_eq!(Ok(0), szx_for_size(16));
        assert_eq!(Ok(0), szx_for_size(31));
        assert_eq!(Ok(2), szx_for_size(64));
        assert_eq!(Ok(6), szx_for_size(1024));
        // Sizes past 1024 clamp to the largest plain exponent.
        assert_eq!(Ok(6), szx_for_size(4096));
    }
}

//! The in-memory CoAP message model the transfer layer operates on.
//!
//! Byte-level serialisation belongs to the transport-specific codec (UDP
//! and reliable-transport framing differ); this module only provides the
//! structured view: header, token, options and payload, with typed
//! accessors for the options the blockwise machinery touches.

use alloc::{collections::BTreeMap, vec::Vec};
use core::convert::TryFrom;

use crate::{
    error::IncompatibleOptionValueFormat,
    header::Header,
    option_value::{OptionValueType, OptionValueU16, OptionValueU32},
};

/// The CoAP options relevant to block transfers, with an escape hatch for
/// everything else. The full registry lives with the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoapOption {
    ETag,
    Observe,
    UriPath,
    ContentFormat,
    UriQuery,
    Block2,
    Block1,
    Size2,
    Size1,
    Unknown(u16),
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            4 => CoapOption::ETag,
            6 => CoapOption::Observe,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            15 => CoapOption::UriQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            60 => CoapOption::Size1,
            _ => CoapOption::Unknown(number),
        }
    }
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::ETag => 4,
            CoapOption::Observe => 6,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::UriQuery => 15,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::Size1 => 60,
            CoapOption::Unknown(number) => number,
        }
    }
}

/// The CoAP packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub header: Header,
    token: Vec<u8>,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates a new packet.
    pub fn new() -> Packet {
        Default::default()
    }

    /// Returns an iterator over the options of the packet, in option-number
    /// order.
    pub fn options(
        &self,
    ) -> impl Iterator<Item = (&u16, &Vec<Vec<u8>>)> + '_ {
        self.options.iter()
    }

    /// Sets the token.
    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = token;
    }

    /// Returns the token.
    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    /// Replaces an option's values.
    pub fn set_option(&mut self, tp: CoapOption, value: Vec<Vec<u8>>) {
        self.options.insert(tp.into(), value);
    }

    /// Replaces an option with a single structured value.
    pub fn set_option_as<T: OptionValueType>(
        &mut self,
        tp: CoapOption,
        value: T,
    ) {
        self.set_option(tp, vec![value.into()]);
    }

    /// Returns an option's values.
    pub fn get_option(&self, tp: CoapOption) -> Option<&Vec<Vec<u8>>> {
        self.options.get(&tp.into())
    }

    /// Returns an option's first value as a convenience when only one is
    /// expected.
    pub fn get_first_option(&self, tp: CoapOption) -> Option<&[u8]> {
        self.options
            .get(&tp.into())
            .and_then(|values| values.first())
            .map(Vec::as_slice)
    }

    /// Returns an option's first value decoded with the given structured
    /// option value format.
    pub fn get_first_option_as<T: OptionValueType>(
        &self,
        tp: CoapOption,
    ) -> Option<Result<T, IncompatibleOptionValueFormat>> {
        self.get_first_option(tp)
            .map(|value| T::try_from(value.to_vec()))
    }

    /// Adds an option value.
    pub fn add_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options.entry(tp.into()).or_default().push(value);
    }

    /// Adds an option value using a structured option value format.
    pub fn add_option_as<T: OptionValueType>(
        &mut self,
        tp: CoapOption,
        value: T,
    ) {
        self.add_option(tp, value.into());
    }

    /// Removes an option.
    pub fn clear_option(&mut self, tp: CoapOption) {
        self.options.remove(&tp.into());
    }

    /// Sets the raw content-format registry value.
    pub fn set_content_format(&mut self, cf: u16) {
        self.set_option_as(CoapOption::ContentFormat, OptionValueU16(cf));
    }

    /// Returns the raw content-format registry value, if present and
    /// well-formed.
    pub fn get_content_format(&self) -> Option<u16> {
        self.get_first_option_as::<OptionValueU16>(CoapOption::ContentFormat)
            .and_then(|value| value.ok())
            .map(|value| value.0)
    }

    /// Sets the value of the observe option.
    pub fn set_observe_value(&mut self, value: u32) {
        self.set_option_as(CoapOption::Observe, OptionValueU32(value));
    }

    /// Returns the value of the observe option.
    pub fn get_observe_value(
        &self,
    ) -> Option<Result<u32, IncompatibleOptionValueFormat>> {
        self.get_first_option_as::<OptionValueU32>(CoapOption::Observe)
            .map(|value| value.map(|v| v.0))
    }

    /// Sets the ETag option.
    pub fn set_etag(&mut self, etag: Vec<u8>) {
        self.set_option(CoapOption::ETag, vec![etag]);
    }

    /// Returns the first ETag option value.
    pub fn get_etag(&self) -> Option<&[u8]> {
        self.get_first_option(CoapOption::ETag)
    }

    /// Sets a size hint option (Size1 or Size2).
    pub fn set_size_hint(&mut self, tp: CoapOption, size: u32) {
        self.set_option_as(tp, OptionValueU32(size));
    }

    /// Returns a size hint option (Size1 or Size2), if present and
    /// well-formed.
    pub fn get_size_hint(&self, tp: CoapOption) -> Option<u32> {
        self.get_first_option_as::<OptionValueU32>(tp)
            .and_then(|value| value.ok())
            .map(|value| value.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::option_value::OptionValueString;
    use alloc::borrow::ToOwned;

    #[test]
    fn option_number_roundtrip() {
        for i in 0..512 {
            assert_eq!(i, u16::from(CoapOption::from(i)));
        }
    }

    #[test]
    fn add_get_clear() {
        let mut p = Packet::new();
        p.add_option(CoapOption::UriPath, b"sensors".to_vec());
        p.add_option(CoapOption::UriPath, b"temp".to_vec());
        p.add_option(CoapOption::ETag, vec![2]);
        assert_eq!(2, p.get_option(CoapOption::UriPath).unwrap().len());
        assert_eq!(
            Some(b"sensors".as_slice()),
            p.get_first_option(CoapOption::UriPath)
        );

        p.clear_option(CoapOption::ETag);
        assert!(p.get_option(CoapOption::ETag).is_none());
        assert_eq!(1, p.options().count());
    }

    #[test]
    fn set_replaces() {
        let mut p = Packet::new();
        p.add_option(CoapOption::UriQuery, b"a=1".to_vec());
        p.set_option(CoapOption::UriQuery, vec![b"b=2".to_vec()]);
        assert_eq!(
            Some(b"b=2".as_slice()),
            p.get_first_option(CoapOption::UriQuery)
        );
    }

    #[test]
    fn content_format() {
        let mut p = Packet::new();
        assert_eq!(None, p.get_content_format());
        p.set_content_format(42);
        assert_eq!(Some(42), p.get_content_format());
    }

    #[test]
    fn observe() {
        let mut p = Packet::new();
        assert!(p.get_observe_value().is_none());
        p.set_observe_value(7);
        assert_eq!(Some(Ok(7)), p.get_observe_value());
    }

    #[test]
    fn size_hints() {
        let mut p = Packet::new();
        p.set_size_hint(CoapOption::Size1, 8192);
        assert_eq!(Some(8192), p.get_size_hint(CoapOption::Size1));
        assert_eq!(None, p.get_size_hint(CoapOption::Size2));
    }

    #[test]
    fn structured_string_options() {
        let mut p = Packet::new();
        for segment in ["fw", "images", "unicode 😁"] {
            p.add_option_as(
                CoapOption::UriPath,
                OptionValueString(segment.to_owned()),
            );
        }
        let first = p
            .get_first_option_as::<OptionValueString>(CoapOption::UriPath)
            .unwrap()
            .unwrap();
        assert_eq!("fw", first.0);
    }
}

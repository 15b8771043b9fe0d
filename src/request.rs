use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use crate::{
    error::HandlingError,
    header::{MessageClass, RequestType as Method},
    packet::{CoapOption, Packet},
    response::CoapResponse,
};

/// The CoAP request, together with the response under construction and the
/// peer it came from.
#[derive(Clone, Debug)]
pub struct CoapRequest<Endpoint> {
    pub message: Packet,
    pub response: Option<CoapResponse>,
    pub source: Option<Endpoint>,
}

impl<Endpoint> CoapRequest<Endpoint> {
    /// Creates a new request.
    pub fn new() -> CoapRequest<Endpoint> {
        Default::default()
    }

    /// Creates a request from a packet received from `source`.
    pub fn from_packet(
        packet: Packet,
        source: Endpoint,
    ) -> CoapRequest<Endpoint> {
        CoapRequest {
            response: Some(CoapResponse::from_request(&packet)),
            message: packet,
            source: Some(source),
        }
    }

    /// Converts a handling failure into the prepared response, if the error
    /// carries a reportable code. Returns whether a reply should be sent.
    pub fn apply_from_error(&mut self, error: HandlingError) -> bool {
        let code = match error.code {
            Some(code) => code,
            None => return false,
        };
        if let Some(reply) = &mut self.response {
            let message = &mut reply.message;
            message.header.code = MessageClass::Response(code);
            // Diagnostic payloads are plain UTF-8 text (RFC 7252 §5.5.2).
            message.set_content_format(0);
            message.payload = error.message.into_bytes();
            return true;
        }
        false
    }

    /// Sets the method.
    pub fn set_method(&mut self, method: Method) {
        self.message.header.code = MessageClass::Request(method);
    }

    /// Returns the method.
    pub fn get_method(&self) -> Method {
        match self.message.header.code {
            MessageClass::Request(method) => method,
            _ => Method::UnKnown,
        }
    }

    /// Sets the path, splitting it into Uri-Path segments.
    pub fn set_path(&mut self, path: &str) {
        self.message.clear_option(CoapOption::UriPath);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.message
                .add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
    }

    /// Returns the Uri-Path segments joined with `/`. Segments that are not
    /// valid UTF-8 are skipped.
    pub fn get_path(&self) -> String {
        join_str_options(&self.message, CoapOption::UriPath, "/")
    }

    /// Returns the Uri-Query arguments joined with `&`.
    pub fn get_query(&self) -> String {
        join_str_options(&self.message, CoapOption::UriQuery, "&")
    }
}

fn join_str_options(
    message: &Packet,
    tp: CoapOption,
    separator: &str,
) -> String {
    match message.get_option(tp) {
        Some(values) => values
            .iter()
            .filter_map(|value| core::str::from_utf8(value).ok())
            .collect::<Vec<_>>()
            .join(separator),
        None => "".to_string(),
    }
}

impl<Endpoint> Default for CoapRequest<Endpoint> {
    fn default() -> Self {
        CoapRequest {
            response: None,
            message: Packet::new(),
            source: None,
        }
    }
}

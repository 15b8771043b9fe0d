use alloc::{string::String, vec::Vec};

use crate::packet::Packet;
use crate::request::CoapRequest;

/// Canonical identity of a block transfer: peer, token and resource.
///
/// The key is computed from the first message of a transfer and reused
/// verbatim for every later block, so renegotiation mid-transfer cannot
/// detach a peer from its state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferKey<Endpoint: Ord + Clone> {
    peer: Option<Endpoint>,
    token: Vec<u8>,
    path: String,
    query: String,
}

impl<Endpoint: Ord + Clone> TransferKey<Endpoint> {
    /// Derives the key for a request and the peer it belongs to.
    pub fn of_request(request: &CoapRequest<Endpoint>) -> Self {
        Self {
            peer: request.source.clone(),
            token: request.message.get_token().to_vec(),
            path: request.get_path(),
            query: request.get_query(),
        }
    }

    /// Derives the key for an arbitrary packet exchanged with `peer`,
    /// for flows where no request wrapper exists.
    pub fn of_packet(peer: &Endpoint, packet: &Packet) -> Self {
        // Reuse the request accessors for the joined path and query.
        let probe = CoapRequest::<Endpoint> {
            message: packet.clone(),
            response: None,
            source: None,
        };
        Self {
            peer: Some(peer.clone()),
            token: packet.get_token().to_vec(),
            path: probe.get_path(),
            query: probe.get_query(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CoapOption;
    use alloc::string::ToString;

    fn request(
        peer: &str,
        token: &[u8],
        path: &str,
        query: Option<&str>,
    ) -> CoapRequest<String> {
        let mut packet = Packet::new();
        packet.set_token(token.to_vec());
        if let Some(query) = query {
            packet.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
        }
        let mut request = CoapRequest::from_packet(packet, peer.to_string());
        request.set_path(path);
        request
    }

    #[test]
    fn equal_for_same_transfer() {
        let a = TransferKey::of_request(&request(
            "10.0.0.1:5683",
            &[1, 2],
            "fw/core",
            None,
        ));
        let b = TransferKey::of_request(&request(
            "10.0.0.1:5683",
            &[1, 2],
            "fw/core",
            None,
        ));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_per_component() {
        let base = request("10.0.0.1:5683", &[1, 2], "fw/core", None);
        let key = TransferKey::of_request(&base);

        let other_peer = request("10.0.0.2:5683", &[1, 2], "fw/core", None);
        assert_ne!(key, TransferKey::of_request(&other_peer));

        let other_token = request("10.0.0.1:5683", &[9], "fw/core", None);
        assert_ne!(key, TransferKey::of_request(&other_token));

        let other_path = request("10.0.0.1:5683", &[1, 2], "fw/radio", None);
        assert_ne!(key, TransferKey::of_request(&other_path));

        let with_query =
            request("10.0.0.1:5683", &[1, 2], "fw/core", Some("rev=2"));
        assert_ne!(key, TransferKey::of_request(&with_query));
    }

    #[test]
    fn packet_and_request_derivations_agree() {
        let request = request("10.0.0.1:5683", &[1, 2], "fw/core", None);
        let from_packet = TransferKey::of_packet(
            request.source.as_ref().unwrap(),
            &request.message,
        );
        assert_eq!(TransferKey::of_request(&request), from_packet);
    }
}

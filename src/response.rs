use crate::{
    header::{MessageClass, MessageType, ResponseType as Status},
    packet::Packet,
};

/// The CoAP response.
#[derive(Clone, Debug)]
pub struct CoapResponse {
    pub message: Packet,
}

impl CoapResponse {
    /// Creates an empty response matching a request: same MID and token,
    /// acknowledgement type for confirmable requests.
    ///
    /// On reliable transports every request can be answered, so unlike a
    /// datagram stack this constructor is total.
    pub fn from_request(request: &Packet) -> CoapResponse {
        let mut packet = Packet::new();

        packet.header.version = 1;
        packet.header.mtype = match request.header.mtype {
            MessageType::Confirmable => MessageType::Acknowledgement,
            other => other,
        };
        packet.header.code = MessageClass::Response(Status::Content);
        packet.header.message_id = request.header.message_id;
        packet.set_token(request.get_token().to_vec());

        CoapResponse { message: packet }
    }

    /// Sets the status.
    pub fn set_status(&mut self, status: Status) {
        self.message.header.code = MessageClass::Response(status);
    }

    /// Returns the status.
    pub fn get_status(&self) -> Status {
        match self.message.header.code {
            MessageClass::Response(status) => status,
            _ => Status::UnKnown,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mirrors_request_identity() {
        let mut request = Packet::new();
        request.header.message_id = 4711;
        request.set_token(vec![0xDE, 0xAD]);

        let response = CoapResponse::from_request(&request);
        assert_eq!(4711, response.message.header.message_id);
        assert_eq!(&[0xDE, 0xAD], response.message.get_token());
        assert_eq!(
            MessageType::Acknowledgement,
            response.message.header.mtype
        );
        assert!(response.message.payload.is_empty());
    }

    #[test]
    fn non_confirmable_keeps_type() {
        let mut request = Packet::new();
        request.header.mtype = MessageType::NonConfirmable;
        let response = CoapResponse::from_request(&request);
        assert_eq!(
            MessageType::NonConfirmable,
            response.message.header.mtype
        );
    }

    #[test]
    fn status_roundtrip() {
        let mut response = CoapResponse::from_request(&Packet::new());
        response.set_status(Status::Continue);
        assert_eq!(Status::Continue, response.get_status());
    }
}

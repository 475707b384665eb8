//! ICMP echo request/reply (ping) — the only ICMP traffic the host answers.

use crate::checksum::internet_checksum;

const TYPE_ECHO_REQUEST: u8 = 8;
const TYPE_ECHO_REPLY: u8 = 0;

pub struct EchoRequest<'a> {
    pub identifier: u16,
    pub sequence: u16,
    pub data: &'a [u8],
}

impl<'a> EchoRequest<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 8 || data[0] != TYPE_ECHO_REQUEST || data[1] != 0 {
            return None;
        }
        Some(Self {
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            data: &data[8..],
        })
    }
}

/// Builds an echo reply mirroring the identifier, sequence and payload of
/// the given request.
pub fn build_echo_reply(request: &EchoRequest<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + request.data.len());
    out.push(TYPE_ECHO_REPLY);
    out.push(0);
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&request.identifier.to_be_bytes());
    out.extend_from_slice(&request.sequence.to_be_bytes());
    out.extend_from_slice(request.data);

    let checksum = internet_checksum(&out);
    out[2] = (checksum >> 8) as u8;
    out[3] = (checksum & 0xff) as u8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_mirrors_request_payload() {
        let mut req_bytes = vec![8, 0, 0, 0];
        req_bytes.extend_from_slice(&1234u16.to_be_bytes());
        req_bytes.extend_from_slice(&1u16.to_be_bytes());
        req_bytes.extend_from_slice(b"abcdefgh");

        let req = EchoRequest::parse(&req_bytes).unwrap();
        let reply = build_echo_reply(&req);
        assert_eq!(reply[0], TYPE_ECHO_REPLY);
        assert_eq!(&reply[8..], b"abcdefgh");
        assert_eq!(internet_checksum(&reply), 0);
    }
}

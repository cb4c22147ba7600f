//! SOCKET.IO framing transform.
//!
//! Packet grammar (type digit first):
//! `0<ns>,<query>` CONNECT, `1<ns>` DISCONNECT, `2<event>,[ackId,]<data>`
//! EVENT, `3/<ackId>,<data>` ACK, `5-<n><event>,[ackId,]<data>` BINARY_EVENT
//! with `n` binary attachments. CONNECT and ACK never reach dispatch; EVENT
//! and BINARY_EVENT fill a message addressed by the event name, with the
//! ack id as the correlation index.

use tether_wire::{Flags, Message, Protocol, MAGIC_PATH_JSON};

use crate::Error;
use crate::transport::ws::{Decoded, FrameTransform, WsPayload};

pub struct SocketIo {
    /// Namespace answered in CONNECT replies when the client names none.
    pub namespace: String,
}

impl Default for SocketIo {
    fn default() -> Self {
        SocketIo {
            namespace: "/".to_string(),
        }
    }
}

impl SocketIo {
    pub fn new(namespace: impl Into<String>) -> Self {
        SocketIo {
            namespace: namespace.into(),
        }
    }

    fn connect_reply(&self, sid: u64, data: &[u8]) -> String {
        let mut ns = self.namespace.clone();
        if let Some(slash) = data.iter().position(|&b| b == b'/') {
            let rest = &data[slash..];
            let end = rest.iter().position(|&b| b == b',').unwrap_or(rest.len());
            if let Ok(parsed) = std::str::from_utf8(&rest[..end]) {
                ns = parsed.to_string();
            }
        }
        format!(
            "0{ns},{{\"sid\": \"{sid}\", \"upgrades\": [\"websocket\"], \"pingInterval\": 25000, \"pingTimeout\": 5000}}"
        )
    }

    fn fill_event(
        &self,
        payload: &[u8],
        msg: &mut Message,
        protocol: &Protocol,
    ) -> Result<Decoded, Error> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::Wire(tether_wire::WireError::PathEncoding))?;
        let Some((event, rest)) = text.split_once(',') else {
            tracing::warn!("socket.io event packet missing comma");
            return Ok(Decoded::Skip);
        };
        let (ack_id, data) = split_ack_id(rest);
        let mut flags = Flags::empty();
        if ack_id > 0 {
            flags |= Flags::NEED_ACK;
        }
        msg.marshal_bytes(
            MAGIC_PATH_JSON,
            flags,
            ack_id,
            event,
            data.as_bytes(),
            protocol,
        )?;
        Ok(Decoded::Filled)
    }
}

/// An event body may lead with a numeric ack id: `<ackId>,<data>`.
fn split_ack_id(rest: &str) -> (u32, &str) {
    let Some(first) = rest.chars().next() else {
        return (0, rest);
    };
    if !first.is_ascii_digit() {
        return (0, rest);
    }
    match rest.split_once(',') {
        Some((id, data)) => match id.parse::<u32>() {
            Ok(ack_id) => (ack_id, data),
            Err(_) => (0, rest),
        },
        None => (0, rest),
    }
}

impl FrameTransform for SocketIo {
    fn decode(
        &self,
        sid: u64,
        payload: &[u8],
        msg: &mut Message,
        protocol: &Protocol,
    ) -> Result<Decoded, Error> {
        let packet_type = payload[0].wrapping_sub(b'0');
        let data = &payload[1..];
        match packet_type {
            0 => Ok(Decoded::Reply(self.connect_reply(sid, data))),
            1 => Ok(Decoded::Closed),
            2 => self.fill_event(data, msg, protocol),
            3 => Ok(Decoded::Skip),
            5 => {
                // Strip the attachment count: "5-<n>/event,..."
                let Some(dash) = data.iter().position(|&b| b == b'-') else {
                    tracing::warn!("socket.io binary event missing attachment count");
                    return Ok(Decoded::Skip);
                };
                let rest = &data[dash + 1..];
                let event_start = rest.iter().position(|&b| !b.is_ascii_digit()).unwrap_or(0);
                self.fill_event(&rest[event_start..], msg, protocol)
            }
            other => {
                tracing::warn!(packet_type = other, "unsupported socket.io packet type");
                Ok(Decoded::Skip)
            }
        }
    }

    fn encode(&self, msg: &Message, protocol: &Protocol) -> Result<WsPayload, Error> {
        let (path, _) = msg.path(protocol)?;
        let body = msg.body(protocol)?;
        let body = std::str::from_utf8(body)
            .map_err(|_| Error::Wire(tether_wire::WireError::PathEncoding))?;
        let packet = if msg.flags().contains(Flags::IS_ACK) {
            format!("3/{},{}", msg.index(), body)
        } else {
            format!("2/{},{}", path.trim_start_matches('/'), body)
        };
        Ok(WsPayload::Text(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::{Limits, Protocol};

    fn protocol() -> Protocol {
        Protocol::new(Limits::default(), false)
    }

    #[test]
    fn event_with_ack_id_needs_ack() {
        let protocol = protocol();
        let transform = SocketIo::default();
        let mut msg = Message::new();
        let decoded = transform
            .decode(1, b"2/chat,123,\"hello\"", &mut msg, &protocol)
            .unwrap();
        assert!(matches!(decoded, Decoded::Filled));
        assert_eq!(msg.index(), 123);
        assert!(msg.flags().contains(Flags::NEED_ACK));
        let (path, _) = msg.path(&protocol).unwrap();
        assert_eq!(path, "/chat");
        assert_eq!(msg.body(&protocol).unwrap(), b"\"hello\"");
    }

    #[test]
    fn event_without_ack_id() {
        let protocol = protocol();
        let transform = SocketIo::default();
        let mut msg = Message::new();
        transform
            .decode(1, b"2/chat,hello world", &mut msg, &protocol)
            .unwrap();
        assert_eq!(msg.index(), 0);
        assert!(!msg.flags().contains(Flags::NEED_ACK));
        assert_eq!(msg.body(&protocol).unwrap(), b"hello world");
    }

    #[test]
    fn connect_replies_with_session_descriptor() {
        let protocol = protocol();
        let transform = SocketIo::default();
        let mut msg = Message::new();
        let decoded = transform
            .decode(42, b"0/chat,?token=abc", &mut msg, &protocol)
            .unwrap();
        match decoded {
            Decoded::Reply(text) => {
                assert!(text.starts_with("0/chat,"));
                assert!(text.contains("\"sid\": \"42\""));
            }
            _ => panic!("expected connect reply"),
        }
    }

    #[test]
    fn disconnect_surfaces_as_closed() {
        let protocol = protocol();
        let transform = SocketIo::default();
        let mut msg = Message::new();
        let decoded = transform.decode(1, b"1/chat", &mut msg, &protocol).unwrap();
        assert!(matches!(decoded, Decoded::Closed));
    }

    #[test]
    fn ack_packets_are_consumed() {
        let protocol = protocol();
        let transform = SocketIo::default();
        let mut msg = Message::new();
        let decoded = transform
            .decode(1, b"3/7,\"done\"", &mut msg, &protocol)
            .unwrap();
        assert!(matches!(decoded, Decoded::Skip));
    }

    #[test]
    fn binary_event_strips_attachment_count() {
        let protocol = protocol();
        let transform = SocketIo::default();
        let mut msg = Message::new();
        let decoded = transform
            .decode(1, b"5-1/chat,77,payload", &mut msg, &protocol)
            .unwrap();
        assert!(matches!(decoded, Decoded::Filled));
        assert_eq!(msg.index(), 77);
        let (path, _) = msg.path(&protocol).unwrap();
        assert_eq!(path, "/chat");
    }

    #[test]
    fn outbound_ack_and_event_packets() {
        let protocol = protocol();
        let transform = SocketIo::default();

        let mut ack = Message::new();
        ack.marshal_bytes(MAGIC_PATH_JSON, Flags::IS_ACK, 9, "/chat", b"\"ok\"", &protocol)
            .unwrap();
        match transform.encode(&ack, &protocol).unwrap() {
            WsPayload::Text(text) => assert_eq!(text, "3/9,\"ok\""),
            WsPayload::Binary(_) => panic!("expected text"),
        }

        let mut event = Message::new();
        event
            .marshal_bytes(MAGIC_PATH_JSON, Flags::empty(), 0, "/news", b"\"hi\"", &protocol)
            .unwrap();
        match transform.encode(&event, &protocol).unwrap() {
            WsPayload::Text(text) => assert_eq!(text, "2/news,\"hi\""),
            WsPayload::Binary(_) => panic!("expected text"),
        }
    }
}

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Flags, Head, PathMode, Protocol, WireError, HEAD_SIZE};

/// One unit transferred across a connection.
///
/// The head carries the magic byte, flag byte, body size, and correlation
/// index; the body holds the addressing prefix (length-delimited path or
/// numeric code, depending on the magic's path-mode) followed by the encoded
/// payload.
///
/// Messages are acquired from the pool via [`Protocol::acquire`] and handed
/// back with [`Protocol::release`]; a released message must not be touched.
#[derive(Debug, Default)]
pub struct Message {
    head: Head,
    body: Vec<u8>,
}

impl Message {
    pub fn new() -> Self {
        Message::default()
    }

    pub fn magic(&self) -> u8 {
        self.head.magic
    }

    pub fn flags(&self) -> Flags {
        self.head.flags
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.head.flags = flags;
    }

    /// Declared body size in bytes (the uncompressed size once received).
    pub fn size(&self) -> u32 {
        self.head.size
    }

    /// Correlation index matching a reply to its request.
    pub fn index(&self) -> u32 {
        self.head.index
    }

    pub fn set_index(&mut self, index: u32) {
        self.head.index = index;
    }

    /// Current body buffer capacity; pooled reuse keeps this bounded.
    pub fn body_capacity(&self) -> usize {
        self.body.capacity()
    }

    /// Parse a head read off a stream transport. The body is filled by a
    /// following [`read_body`](Message::read_body).
    pub fn parse_head(&mut self, buf: &[u8], protocol: &Protocol) -> Result<(), WireError> {
        self.head = Head::parse(buf, protocol)?;
        self.body.clear();
        Ok(())
    }

    /// Fill exactly `size` body bytes from the reader, then inflate when the
    /// COMPRESSED flag is set.
    ///
    /// Capacity policy: reuse the existing buffer when it is large enough;
    /// allocate exactly for oversized bodies; otherwise allocate at the
    /// configured default capacity so pooled reuse amortizes.
    pub async fn read_body<R>(&mut self, reader: &mut R, protocol: &Protocol) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
    {
        let size = self.head.size as usize;
        if size == 0 {
            self.body.clear();
            return Ok(());
        }
        if self.body.capacity() >= size {
            self.body.resize(size, 0);
        } else if size > protocol.limits.capacity {
            self.body = vec![0; size];
        } else {
            let mut body = Vec::with_capacity(protocol.limits.capacity);
            body.resize(size, 0);
            self.body = body;
        }
        reader.read_exact(&mut self.body).await?;
        self.inflate(protocol)
    }

    /// Fill the message from one complete datagram or frame (UDP, WebSocket):
    /// head and body parsed out of a single buffer.
    pub fn reset(&mut self, buf: &[u8], protocol: &Protocol) -> Result<(), WireError> {
        if buf.len() < HEAD_SIZE {
            return Err(WireError::HeadIllegal);
        }
        self.head = Head::parse(&buf[..HEAD_SIZE], protocol)?;
        let body = &buf[HEAD_SIZE..];
        if body.len() != self.head.size as usize {
            return Err(WireError::SizeMismatch {
                len: body.len(),
                size: self.head.size,
            });
        }
        self.body.clear();
        self.body.extend_from_slice(body);
        self.inflate(protocol)
    }

    /// Serialize for the wire into `out`, head first when requested.
    ///
    /// Bodies above the auto-compress threshold are gzip-compressed on the
    /// way out; the in-memory buffer is left untouched and only the wire
    /// copy of the head carries the COMPRESSED flag and compressed size.
    pub fn to_bytes(
        &self,
        out: &mut Vec<u8>,
        include_head: bool,
        protocol: &Protocol,
    ) -> Result<(), WireError> {
        let size = self.head.size as usize;
        let auto = protocol.limits.auto_compress_size;
        let compress = include_head
            && auto > 0
            && self.head.size > auto
            && !self.head.flags.contains(Flags::COMPRESSED);

        if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.body[..size])?;
            let compressed = encoder.finish()?;
            let wire_flags = self.head.flags | Flags::COMPRESSED;
            self.head
                .write_to(out, wire_flags, compressed.len() as u32, protocol)?;
            out.extend_from_slice(&compressed);
        } else {
            if include_head {
                self.head
                    .write_to(out, self.head.flags, self.head.size, protocol)?;
            }
            out.extend_from_slice(&self.body[..size]);
        }
        Ok(())
    }

    /// The handler path and query string addressed by this message.
    ///
    /// Path-mode magics read the length-delimited path out of the body;
    /// code-mode magics resolve the numeric code through the installed
    /// transform. A `?` splits path from query.
    pub fn path(&self, protocol: &Protocol) -> Result<(String, String), WireError> {
        let magic = protocol.require_magic(self.head.magic)?;
        let raw = match magic.mode {
            PathMode::Path => {
                let len = self.path_prefix_len(protocol)?;
                std::str::from_utf8(&self.body[4..4 + len])
                    .map_err(|_| WireError::PathEncoding)?
                    .to_string()
            }
            PathMode::Code => {
                if self.body.len() < 4 {
                    return Err(WireError::BodyTruncated);
                }
                let code = magic.order.get_u32(&self.body[..4]);
                protocol.transform()?.path(code)?
            }
        };
        match raw.split_once('?') {
            Some((path, query)) => Ok((path.to_string(), query.to_string())),
            None => Ok((raw, String::new())),
        }
    }

    /// The encoded payload after the addressing prefix.
    pub fn body(&self, protocol: &Protocol) -> Result<&[u8], WireError> {
        let magic = protocol.require_magic(self.head.magic)?;
        let offset = match magic.mode {
            PathMode::Path => 4 + self.path_prefix_len(protocol)?,
            PathMode::Code => {
                if self.body.len() < 4 {
                    return Err(WireError::BodyTruncated);
                }
                4
            }
        };
        Ok(&self.body[offset..])
    }

    /// Fill the message from a typed body, encoding with the magic's format.
    pub fn marshal<T: Serialize>(
        &mut self,
        magic: u8,
        flags: Flags,
        index: u32,
        path: &str,
        body: &T,
        protocol: &Protocol,
    ) -> Result<(), WireError> {
        let encoded = protocol.require_magic(magic)?.encoding.encode(body)?;
        self.fill(magic, flags, index, path, &encoded, protocol)
    }

    /// Fill the message from pre-serialized body bytes, written verbatim.
    pub fn marshal_bytes(
        &mut self,
        magic: u8,
        flags: Flags,
        index: u32,
        path: &str,
        body: &[u8],
        protocol: &Protocol,
    ) -> Result<(), WireError> {
        self.fill(magic, flags, index, path, body, protocol)
    }

    /// Decode the payload with the encoding bound to this message's magic.
    pub fn unmarshal<T: DeserializeOwned>(&self, protocol: &Protocol) -> Result<T, WireError> {
        let magic = protocol.require_magic(self.head.magic)?;
        magic.encoding.decode(self.body(protocol)?)
    }

    /// Reset all fields for pooled reuse, capping the retained capacity.
    pub(crate) fn clear(&mut self, capacity: usize) {
        self.head.clear();
        self.body.clear();
        if self.body.capacity() > capacity {
            self.body.shrink_to(capacity);
        }
    }

    fn fill(
        &mut self,
        magic_key: u8,
        flags: Flags,
        index: u32,
        path: &str,
        body: &[u8],
        protocol: &Protocol,
    ) -> Result<(), WireError> {
        let magic = *protocol.require_magic(magic_key)?;
        self.body.clear();
        match magic.mode {
            PathMode::Path => {
                magic.order.put_u32(path.len() as u32, &mut self.body);
                self.body.extend_from_slice(path.as_bytes());
            }
            PathMode::Code => {
                let code = protocol.transform()?.code(path)?;
                magic.order.put_u32(code, &mut self.body);
            }
        }
        self.body.extend_from_slice(body);
        self.head = Head {
            magic: magic_key,
            flags,
            size: self.body.len() as u32,
            index,
        };
        Ok(())
    }

    /// Decompress the body in place, clear the flag, update the size.
    fn inflate(&mut self, protocol: &Protocol) -> Result<(), WireError> {
        if !self.head.flags.contains(Flags::COMPRESSED) {
            return Ok(());
        }
        let mut inflated = Vec::with_capacity(protocol.limits.capacity.max(self.body.len()));
        {
            let mut decoder = GzDecoder::new(self.body.as_slice());
            decoder.read_to_end(&mut inflated)?;
        }
        let max = protocol.limits.max_data_size;
        if inflated.len() > max as usize {
            return Err(WireError::DataTooLong {
                size: inflated.len() as u32,
                max,
            });
        }
        self.body = inflated;
        self.head.flags.remove(Flags::COMPRESSED);
        self.head.size = self.body.len() as u32;
        Ok(())
    }

    fn path_prefix_len(&self, protocol: &Protocol) -> Result<usize, WireError> {
        let magic = protocol.require_magic(self.head.magic)?;
        if self.body.len() < 4 {
            return Err(WireError::BodyTruncated);
        }
        let len = magic.order.get_u32(&self.body[..4]) as usize;
        if 4 + len > self.body.len() {
            return Err(WireError::BodyTruncated);
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Limits, MapTransform, MAGIC_CODE_JSON, MAGIC_PATH_JSON};

    fn protocol() -> Protocol {
        Protocol::new(Limits::default(), false)
    }

    async fn wire_round_trip(msg: &Message, protocol: &Protocol) -> Message {
        let mut wire = Vec::new();
        msg.to_bytes(&mut wire, true, protocol).unwrap();

        let mut back = Message::new();
        back.parse_head(&wire[..HEAD_SIZE], protocol).unwrap();
        let mut reader = &wire[HEAD_SIZE..];
        back.read_body(&mut reader, protocol).await.unwrap();
        back
    }

    #[tokio::test]
    async fn frame_round_trip_preserves_every_field() {
        let protocol = protocol();
        let mut msg = Message::new();
        msg.marshal(
            MAGIC_PATH_JSON,
            Flags::NEED_ACK,
            7,
            "/ping",
            &"hi",
            &protocol,
        )
        .unwrap();

        let back = wire_round_trip(&msg, &protocol).await;
        assert_eq!(back.magic(), MAGIC_PATH_JSON);
        assert_eq!(back.flags(), Flags::NEED_ACK);
        assert_eq!(back.index(), 7);
        let (path, query) = back.path(&protocol).unwrap();
        assert_eq!(path, "/ping");
        assert_eq!(query, "");
        let body: String = back.unmarshal(&protocol).unwrap();
        assert_eq!(body, "hi");
    }

    #[tokio::test]
    async fn query_splits_off_the_path() {
        let protocol = protocol();
        let mut msg = Message::new();
        msg.marshal(MAGIC_PATH_JSON, Flags::empty(), 0, "/ping?t=1", &(), &protocol)
            .unwrap();
        let back = wire_round_trip(&msg, &protocol).await;
        let (path, query) = back.path(&protocol).unwrap();
        assert_eq!(path, "/ping");
        assert_eq!(query, "t=1");
    }

    #[tokio::test]
    async fn oversized_body_compresses_on_the_wire_only() {
        let protocol = Protocol::new(
            Limits {
                auto_compress_size: 64,
                ..Limits::default()
            },
            false,
        );
        let payload = vec![42u8; 1024];
        let mut msg = Message::new();
        msg.marshal_bytes(MAGIC_PATH_JSON, Flags::empty(), 3, "/blob", &payload, &protocol)
            .unwrap();

        let mut wire = Vec::new();
        msg.to_bytes(&mut wire, true, &protocol).unwrap();

        // In-memory message is untouched, wire head carries the flag.
        assert!(!msg.flags().contains(Flags::COMPRESSED));
        assert!(Flags::from_bits_truncate(wire[1]).contains(Flags::COMPRESSED));
        assert!(wire.len() < HEAD_SIZE + msg.size() as usize);

        let mut back = Message::new();
        back.parse_head(&wire[..HEAD_SIZE], &protocol).unwrap();
        let mut reader = &wire[HEAD_SIZE..];
        back.read_body(&mut reader, &protocol).await.unwrap();

        assert!(!back.flags().contains(Flags::COMPRESSED));
        assert_eq!(back.size(), msg.size());
        assert_eq!(back.body(&protocol).unwrap(), payload.as_slice());
    }

    #[tokio::test]
    async fn small_body_stays_uncompressed() {
        let protocol = Protocol::new(
            Limits {
                auto_compress_size: 64,
                ..Limits::default()
            },
            false,
        );
        let mut msg = Message::new();
        msg.marshal_bytes(MAGIC_PATH_JSON, Flags::empty(), 0, "/s", b"tiny", &protocol)
            .unwrap();
        let mut wire = Vec::new();
        msg.to_bytes(&mut wire, true, &protocol).unwrap();
        assert!(!Flags::from_bits_truncate(wire[1]).contains(Flags::COMPRESSED));
        assert_eq!(wire.len(), HEAD_SIZE + msg.size() as usize);
    }

    #[test]
    fn reset_parses_a_complete_datagram() {
        let protocol = protocol();
        let mut msg = Message::new();
        msg.marshal(MAGIC_PATH_JSON, Flags::IS_ACK, 11, "/ack", &"ok", &protocol)
            .unwrap();
        let mut wire = Vec::new();
        msg.to_bytes(&mut wire, true, &protocol).unwrap();

        let mut back = Message::new();
        back.reset(&wire, &protocol).unwrap();
        assert_eq!(back.index(), 11);
        assert_eq!(back.flags(), Flags::IS_ACK);
        let (path, _) = back.path(&protocol).unwrap();
        assert_eq!(path, "/ack");
    }

    #[test]
    fn reset_rejects_truncated_datagrams() {
        let protocol = protocol();
        let mut msg = Message::new();
        msg.marshal(MAGIC_PATH_JSON, Flags::empty(), 0, "/x", &"body", &protocol)
            .unwrap();
        let mut wire = Vec::new();
        msg.to_bytes(&mut wire, true, &protocol).unwrap();
        wire.truncate(wire.len() - 1);

        let mut back = Message::new();
        assert!(matches!(
            back.reset(&wire, &protocol),
            Err(WireError::SizeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn code_mode_addresses_through_the_transform() {
        let mut protocol = protocol();
        let mut transform = MapTransform::new();
        transform.insert(12, "/ping");
        protocol.set_transform(Arc::new(transform));

        let mut msg = Message::new();
        msg.marshal(MAGIC_CODE_JSON, Flags::empty(), 1, "/ping", &"hi", &protocol)
            .unwrap();
        let back = wire_round_trip(&msg, &protocol).await;
        let (path, _) = back.path(&protocol).unwrap();
        assert_eq!(path, "/ping");
        let body: String = back.unmarshal(&protocol).unwrap();
        assert_eq!(body, "hi");
    }

    #[test]
    fn code_mode_without_transform_fails() {
        let protocol = protocol();
        let mut msg = Message::new();
        let err = msg
            .marshal(MAGIC_CODE_JSON, Flags::empty(), 0, "/ping", &(), &protocol)
            .unwrap_err();
        assert!(matches!(err, WireError::TransformMissing));
    }

    #[tokio::test]
    async fn body_buffer_reuse_follows_capacity_policy() {
        let protocol = Protocol::new(
            Limits {
                capacity: 32,
                ..Limits::default()
            },
            false,
        );
        let mut src = Message::new();
        src.marshal_bytes(MAGIC_PATH_JSON, Flags::empty(), 0, "/c", &[1u8; 8], &protocol)
            .unwrap();
        let mut wire = Vec::new();
        src.to_bytes(&mut wire, true, &protocol).unwrap();

        // Small body: allocated at the default capacity.
        let mut msg = Message::new();
        msg.parse_head(&wire[..HEAD_SIZE], &protocol).unwrap();
        let mut reader = &wire[HEAD_SIZE..];
        msg.read_body(&mut reader, &protocol).await.unwrap();
        assert_eq!(msg.body_capacity(), 32);

        // Large body: allocated exactly.
        let mut src = Message::new();
        src.marshal_bytes(MAGIC_PATH_JSON, Flags::empty(), 0, "/c", &[1u8; 100], &protocol)
            .unwrap();
        let mut wire = Vec::new();
        src.to_bytes(&mut wire, true, &protocol).unwrap();
        let mut msg = Message::new();
        msg.parse_head(&wire[..HEAD_SIZE], &protocol).unwrap();
        let mut reader = &wire[HEAD_SIZE..];
        msg.read_body(&mut reader, &protocol).await.unwrap();
        assert_eq!(msg.body_capacity(), src.size() as usize);
    }
}

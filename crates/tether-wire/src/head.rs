use crate::{Flags, Protocol, WireError};

/// Wire size of the message head: `[magic:1][flag:1][size:4][index:4]`.
pub const HEAD_SIZE: usize = 10;

/// Parsed message head. The integer fields use the byte order declared by
/// the magic entry, so parsing requires the [`Protocol`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Head {
    pub(crate) magic: u8,
    pub(crate) flags: Flags,
    pub(crate) size: u32,
    pub(crate) index: u32,
}

impl Head {
    /// Parse a head from exactly [`HEAD_SIZE`] bytes.
    ///
    /// Fails with `HeadIllegal` on a short buffer or unknown magic, and with
    /// `DataTooLong` when the declared size exceeds the configured limit.
    pub fn parse(buf: &[u8], protocol: &Protocol) -> Result<Head, WireError> {
        if buf.len() != HEAD_SIZE {
            return Err(WireError::HeadIllegal);
        }
        let magic = protocol.magic(buf[0]).ok_or(WireError::HeadIllegal)?;
        let head = Head {
            magic: buf[0],
            flags: Flags::from_bits_truncate(buf[1]),
            size: magic.order.get_u32(&buf[2..6]),
            index: magic.order.get_u32(&buf[6..10]),
        };
        let max = protocol.limits.max_data_size;
        if head.size > max {
            return Err(WireError::DataTooLong {
                size: head.size,
                max,
            });
        }
        Ok(head)
    }

    /// Append the head bytes to `out`, overriding the stored flags and size
    /// with the caller's wire copy (compression may change both).
    pub(crate) fn write_to(
        &self,
        out: &mut Vec<u8>,
        wire_flags: Flags,
        wire_size: u32,
        protocol: &Protocol,
    ) -> Result<(), WireError> {
        let magic = protocol.require_magic(self.magic)?;
        out.push(self.magic);
        out.push(wire_flags.bits());
        magic.order.put_u32(wire_size, out);
        magic.order.put_u32(self.index, out);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        *self = Head::default();
    }
}

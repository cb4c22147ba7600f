use bitflags::bitflags;

bitflags! {
    /// The flag byte carried in every message head.
    ///
    /// Flags compose: an acknowledgement to a broadcast request may carry
    /// `IS_ACK | BROADCAST`. `COMPRESSED` is owned by the codec: it is set
    /// on the wire when the body is gzip-compressed and cleared again once
    /// the receiver has inflated the body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        /// Body bytes are gzip-compressed.
        const COMPRESSED = 1 << 0;
        /// Body bytes are encrypted by the application.
        const ENCRYPTED = 1 << 1;
        /// Sender expects an acknowledgement for this message.
        const NEED_ACK = 1 << 2;
        /// This message is an acknowledgement.
        const IS_ACK = 1 << 3;
        /// Pure liveness traffic, never dispatched to handlers.
        const HEARTBEAT = 1 << 4;
        /// Message was fanned out to multiple sockets.
        const BROADCAST = 1 << 5;
        /// One fragment of a larger payload.
        const FRAGMENT = 1 << 6;
    }
}

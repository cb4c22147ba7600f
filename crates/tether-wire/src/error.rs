use thiserror::Error;

/// Errors produced while parsing, building, or translating wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// Header shorter than [`HEAD_SIZE`](crate::HEAD_SIZE) or carrying an
    /// unregistered magic byte.
    #[error("message head illegal")]
    HeadIllegal,

    /// Declared body size exceeds the configured limit.
    #[error("message data too long: {size} exceeds limit {max}")]
    DataTooLong { size: u32, max: u32 },

    /// A magic value was registered twice.
    #[error("magic 0x{0:02x} already registered")]
    MagicExists(u8),

    /// Marshal was asked to use a magic that is not in the table.
    #[error("magic 0x{0:02x} not registered")]
    MagicUnknown(u8),

    /// Code-mode addressing without an installed code/path transform.
    #[error("code mode requires a registered transform")]
    TransformMissing,

    /// No path is registered for the given code (or vice versa).
    #[error("transform has no entry for {0}")]
    TransformUnknown(String),

    /// Body length disagrees with the size declared in the head.
    #[error("message body is {len} bytes, head declares {size}")]
    SizeMismatch { len: usize, size: u32 },

    /// The body region is too short to hold its path or code prefix.
    #[error("message body truncated")]
    BodyTruncated,

    /// The embedded path is not valid UTF-8.
    #[error("message path is not valid utf-8")]
    PathEncoding,

    /// Gzip compression or decompression failed, or a transport read failed
    /// while filling the body.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Body serialization failed.
    #[error("body encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Body deserialization failed.
    #[error("body decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The raw encoding only passes byte slices through.
    #[error("raw encoding cannot serialize structured values")]
    RawUnsupported,
}

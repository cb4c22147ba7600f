//! Wire format for the tether socket framework.
//!
//! A frame is a 10-byte head (`magic | flag | size | index`) followed by a
//! body region. The magic byte selects a registered wire flavor: addressing
//! mode (embedded path vs numeric code), body encoding, and byte order. The
//! flag byte composes delivery semantics (ACK handshake, heartbeat,
//! broadcast, compression). Bodies above a configured threshold travel
//! gzip-compressed.
//!
//! [`Protocol`] bundles the magic table, size limits, the optional
//! code/path [`Transform`], and the message pool; hosts build one, then
//! share it read-only with every connection.

mod encoding;
mod error;
mod flags;
mod head;
mod magic;
mod message;
mod pool;
mod protocol;
mod transform;

pub use encoding::Encoding;
pub use error::WireError;
pub use flags::Flags;
pub use head::{Head, HEAD_SIZE};
pub use magic::{ByteOrder, Magic, MagicTable, PathMode, MAGIC_CODE_JSON, MAGIC_PATH_JSON};
pub use message::Message;
pub use pool::MessagePool;
pub use protocol::{Limits, Protocol};
pub use transform::{MapTransform, Transform};

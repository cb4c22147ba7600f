use std::sync::Arc;

use crate::{
    ByteOrder, Encoding, Magic, MagicTable, Message, MessagePool, PathMode, Transform, WireError,
};

/// Size and allocation policy for message bodies.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Hard cap on the declared body size; larger heads are rejected.
    pub max_data_size: u32,
    /// Default body buffer capacity kept across pooled reuse.
    pub capacity: usize,
    /// Bodies above this many bytes are gzip-compressed on the wire.
    /// Zero disables outbound compression.
    pub auto_compress_size: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_data_size: 1024 * 1024,
            capacity: 1024,
            auto_compress_size: 0,
        }
    }
}

/// Everything the codec needs to interpret frames: the magic table, body
/// limits, the optional code/path transform, and the message pool.
///
/// Built by the host before the hub starts, then shared read-only through an
/// `Arc` to every listener, connection, and socket.
pub struct Protocol {
    magics: MagicTable,
    pub limits: Limits,
    transform: Option<Arc<dyn Transform>>,
    pool: MessagePool,
}

impl Protocol {
    /// Protocol with the built-in magic flavors and the given limits.
    pub fn new(limits: Limits, pooled: bool) -> Self {
        Protocol {
            magics: MagicTable::default(),
            limits,
            transform: None,
            pool: MessagePool::new(pooled, limits.capacity),
        }
    }

    /// Register an additional wire flavor.
    pub fn register_magic(
        &mut self,
        key: u8,
        mode: PathMode,
        encoding: Encoding,
        order: ByteOrder,
    ) -> Result<(), WireError> {
        self.magics.register(key, mode, encoding, order)
    }

    /// Install the code/path transform used by code-mode magics.
    pub fn set_transform(&mut self, transform: Arc<dyn Transform>) {
        self.transform = Some(transform);
    }

    pub fn magic(&self, key: u8) -> Option<&Magic> {
        self.magics.get(key)
    }

    /// Magic lookup that fails with [`WireError::MagicUnknown`].
    pub fn require_magic(&self, key: u8) -> Result<&Magic, WireError> {
        self.magics.get(key).ok_or(WireError::MagicUnknown(key))
    }

    pub fn transform(&self) -> Result<&dyn Transform, WireError> {
        self.transform
            .as_deref()
            .ok_or(WireError::TransformMissing)
    }

    /// Take a message from the pool (or allocate when pooling is off).
    pub fn acquire(&self) -> Message {
        self.pool.acquire()
    }

    /// Return a message to the pool. The message must not be touched again.
    pub fn release(&self, message: Message) {
        self.pool.release(message);
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::new(Limits::default(), true)
    }
}

use crate::{Encoding, WireError};

/// Built-in magic: path-mode addressing, JSON bodies, big-endian integers.
pub const MAGIC_PATH_JSON: u8 = 0x80;
/// Built-in magic: code-mode addressing, JSON bodies, big-endian integers.
pub const MAGIC_CODE_JSON: u8 = 0x81;

/// How the body addresses its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathMode {
    /// Body starts with a length-prefixed path string.
    Path,
    /// Body starts with a numeric code resolved through the installed
    /// [`Transform`](crate::Transform).
    Code,
}

/// Integer byte order declared by a magic entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub fn get_u32(&self, buf: &[u8]) -> u32 {
        let bytes: [u8; 4] = buf[..4].try_into().unwrap_or_default();
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }

    pub fn put_u32(&self, value: u32, out: &mut Vec<u8>) {
        match self {
            ByteOrder::Big => out.extend_from_slice(&value.to_be_bytes()),
            ByteOrder::Little => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// One registered wire flavor: addressing mode, body encoding, byte order.
#[derive(Clone, Copy, Debug)]
pub struct Magic {
    pub key: u8,
    pub mode: PathMode,
    pub encoding: Encoding,
    pub order: ByteOrder,
}

/// Registry of wire flavors keyed by the magic byte.
///
/// Populated before the hub starts and read-only afterwards. Magic `0` is
/// reserved: sockets treat a zero magic as "uninitialized".
pub struct MagicTable {
    entries: [Option<Magic>; 256],
}

impl MagicTable {
    /// An empty table with no registered flavors.
    pub fn empty() -> Self {
        MagicTable {
            entries: [None; 256],
        }
    }

    /// Register a new flavor. Duplicate keys are rejected.
    pub fn register(
        &mut self,
        key: u8,
        mode: PathMode,
        encoding: Encoding,
        order: ByteOrder,
    ) -> Result<(), WireError> {
        if self.entries[key as usize].is_some() {
            return Err(WireError::MagicExists(key));
        }
        self.entries[key as usize] = Some(Magic {
            key,
            mode,
            encoding,
            order,
        });
        Ok(())
    }

    pub fn get(&self, key: u8) -> Option<&Magic> {
        self.entries[key as usize].as_ref()
    }

    pub fn has(&self, key: u8) -> bool {
        self.get(key).is_some()
    }
}

impl Default for MagicTable {
    /// Table with the two built-in flavors registered.
    fn default() -> Self {
        let mut table = MagicTable::empty();
        // Registration into an empty table cannot collide.
        let _ = table.register(MAGIC_PATH_JSON, PathMode::Path, Encoding::Json, ByteOrder::Big);
        let _ = table.register(MAGIC_CODE_JSON, PathMode::Code, Encoding::Json, ByteOrder::Big);
        table
    }
}

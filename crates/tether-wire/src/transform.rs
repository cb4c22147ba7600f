use std::collections::HashMap;

use crate::WireError;

/// Translation between numeric codes and handler paths for code-mode magics.
///
/// Installed once on the [`Protocol`](crate::Protocol) before the hub starts.
/// Without one, code-mode messages fail with
/// [`WireError::TransformMissing`].
pub trait Transform: Send + Sync {
    /// Resolve a wire code to its handler path.
    fn path(&self, code: u32) -> Result<String, WireError>;
    /// Resolve a handler path to its wire code.
    fn code(&self, path: &str) -> Result<u32, WireError>;
}

/// Transform backed by a fixed bidirectional map.
#[derive(Default)]
pub struct MapTransform {
    paths: HashMap<u32, String>,
    codes: HashMap<String, u32>,
}

impl MapTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: u32, path: impl Into<String>) {
        let path = path.into();
        self.paths.insert(code, path.clone());
        self.codes.insert(path, code);
    }
}

impl Transform for MapTransform {
    fn path(&self, code: u32) -> Result<String, WireError> {
        self.paths
            .get(&code)
            .cloned()
            .ok_or_else(|| WireError::TransformUnknown(code.to_string()))
    }

    fn code(&self, path: &str) -> Result<u32, WireError> {
        self.codes
            .get(path)
            .copied()
            .ok_or_else(|| WireError::TransformUnknown(path.to_string()))
    }
}

//! Reader and transform options

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::view::Endian;

/// How a file is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadOptions {
    /// Byte order to decode with, `None` to detect it from the magic
    pub endian: Option<Endian>,
    /// Check that every function and method offset starts a subroutine
    pub verify_offsets: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            endian: None,
            verify_offsets: true,
        }
    }
}

impl ReadOptions {
    /// Parse from a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Which symbolic passes `abstract_all` and `concretize_all` run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformOptions {
    /// String literals
    pub strings: bool,
    /// Member and method names
    pub symbols: bool,
    /// Global variable names
    pub globals: bool,
    /// Class names
    pub classes: bool,
    /// Branch targets
    pub branches: bool,
    /// Jump targets
    pub jumps: bool,
}

impl TransformOptions {
    /// Every pass enabled
    pub const ALL: Self = Self {
        strings: true,
        symbols: true,
        globals: true,
        classes: true,
        branches: true,
        jumps: true,
    };

    /// Every pass disabled
    pub const NONE: Self = Self {
        strings: false,
        symbols: false,
        globals: false,
        classes: false,
        branches: false,
        jumps: false,
    };

    /// Parse from a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self::ALL
    }
}

//! Module IR for the StructZone sanitizer
//!
//! This crate defines a low-level, register-based intermediate representation
//! with typed pointers and named struct types. It is the substrate the
//! sanitizer pass transforms. The IR is designed to be:
//! - Simple and explicit (no implicit operations)
//! - Strongly typed, with struct bodies owned by the module type table
//! - Easy to rewrite in place (instructions are plain data in blocks)
//! - Constructible programmatically through [`builder::ModuleBuilder`]

pub mod blocks;
pub mod builder;
pub mod dump;
pub mod functions;
pub mod instructions;
pub mod modules;
pub mod pass;
pub mod types;

pub use blocks::*;
pub use builder::*;
pub use functions::*;
pub use instructions::*;
pub use modules::*;
pub use pass::*;
pub use types::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// IR version for compatibility checking
pub const IR_VERSION: u32 = 1;

/// Unique identifier for IR registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrId(u32);

impl IrId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn invalid() -> Self {
        Self(u32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for IrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Linkage type for symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    /// Private to the module
    Private,
    /// Available within the module but renameable
    Internal,
    /// Publicly exported
    Public,
    /// External symbol (defined elsewhere)
    External,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ir_id() {
        let id = IrId::new(42);
        assert_eq!(format!("{}", id), "$42");
        assert!(id.is_valid());

        let invalid = IrId::invalid();
        assert!(!invalid.is_valid());
    }
}

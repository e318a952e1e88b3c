//! Transformation errors
//!
//! The sanitizer is a batch transformation: any structural problem in the
//! input IR aborts the whole module transformation with a one-line
//! diagnostic. Nothing is recovered locally and no partial instrumentation
//! is produced.

use std::error::Error;
use std::fmt;

/// A non-recoverable failure of the module transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// A struct type with no layout record was encountered while rewriting
    UnknownStruct { ty: String, context: String },

    /// A struct member was addressed with a runtime index
    NonConstantStructIndex { instruction: String },

    /// An allocator call linked to a struct pointer has a non-constant size
    NonConstantAllocSize { instruction: String },

    /// A stack allocation of structs has a non-constant element count
    NonConstantAllocaCount { instruction: String },

    /// An opaque (untyped) pointer reached an inflation context
    OpaquePointer { context: String },

    /// A struct is passed by value across a wrapped boundary
    StructByValue { function: String, ty: String },

    /// The input module already uses a name reserved for inflated entities
    ReservedName { name: String },

    /// The input IR is not well-formed
    MalformedModule { detail: String },
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::UnknownStruct { ty, context } => {
                write!(f, "unknown struct type {} at: {}", ty, context)
            }
            TransformError::NonConstantStructIndex { instruction } => {
                write!(f, "non-constant struct index at: {}", instruction)
            }
            TransformError::NonConstantAllocSize { instruction } => {
                write!(f, "non-constant allocation size at: {}", instruction)
            }
            TransformError::NonConstantAllocaCount { instruction } => {
                write!(f, "non-constant stack array count at: {}", instruction)
            }
            TransformError::OpaquePointer { context } => {
                write!(f, "opaque pointer in inflation context: {}", context)
            }
            TransformError::StructByValue { function, ty } => {
                write!(
                    f,
                    "struct {} passed by value across the boundary of {}",
                    ty, function
                )
            }
            TransformError::ReservedName { name } => {
                write!(f, "input module already defines reserved name {}", name)
            }
            TransformError::MalformedModule { detail } => {
                write!(f, "malformed module: {}", detail)
            }
        }
    }
}

impl Error for TransformError {}

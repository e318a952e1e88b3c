//! IR Type System
//!
//! Types are lower-level than source types and map directly to memory layout.
//! Struct types are *named references*; their bodies live in the module type
//! table so that identity is nominal, forward declarations (opaque structs)
//! exist, and self-referential structs are expressible.

use super::IrFunctionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a pointer on all supported targets, in bytes.
pub const POINTER_SIZE: u64 = 8;

/// IR type representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrType {
    /// Void type (no value)
    Void,

    /// Boolean type
    Bool,

    /// Integer types
    I8,
    I16,
    I32,
    I64,

    /// Unsigned integer types
    U8,
    U16,
    U32,
    U64,

    /// Floating point types
    F32,
    F64,

    /// Typed pointer
    Ptr(Box<IrType>),

    /// Untyped (opaque) pointer. Representable so that consumers can reject
    /// it explicitly; the sanitizer requires typed-pointer IR.
    OpaquePtr,

    /// Array type with known element count
    Array(Box<IrType>, usize),

    /// Function type
    Function {
        params: Vec<IrType>,
        return_type: Box<IrType>,
        varargs: bool,
    },

    /// Reference to a named struct in the module type table
    Struct(String),
}

impl IrType {
    /// Wrap this type in a pointer
    pub fn ptr_to(self) -> IrType {
        IrType::Ptr(Box::new(self))
    }

    /// Array of `count` elements of this type
    pub fn array_of(self, count: usize) -> IrType {
        IrType::Array(Box::new(self), count)
    }

    /// The pointed-to type, if this is a typed pointer
    pub fn pointee(&self) -> Option<&IrType> {
        match self {
            IrType::Ptr(inner) => Some(inner),
            _ => None,
        }
    }

    /// Check if this is a pointer type (typed or opaque)
    pub fn is_pointer(&self) -> bool {
        matches!(self, IrType::Ptr(_) | IrType::OpaquePtr)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            IrType::I8
                | IrType::I16
                | IrType::I32
                | IrType::I64
                | IrType::U8
                | IrType::U16
                | IrType::U32
                | IrType::U64
        )
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, IrType::F32 | IrType::F64)
    }

    /// Check if this is a struct reference
    pub fn is_struct(&self) -> bool {
        matches!(self, IrType::Struct(_))
    }

    /// The struct name, if this is a struct reference
    pub fn struct_name(&self) -> Option<&str> {
        match self {
            IrType::Struct(name) => Some(name),
            _ => None,
        }
    }

    /// Peel array layers, returning the ultimate element type.
    pub fn strip_arrays(&self) -> &IrType {
        let mut ty = self;
        while let IrType::Array(elem, _) = ty {
            ty = elem;
        }
        ty
    }

    /// Whether a value of this type can be named by a `Const` instruction.
    pub fn is_first_class(&self) -> bool {
        !matches!(self, IrType::Void | IrType::Array(_, _) | IrType::Struct(_))
    }
}

/// IR constant value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrValue {
    /// No value
    Void,
    /// Undefined value
    Undef,
    /// Null pointer
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer values
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// Floating point values
    F32(f32),
    F64(f64),
    /// Function pointer (reference to a function by ID)
    Function(IrFunctionId),
}

impl IrValue {
    /// Interpret this value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            IrValue::I8(v) => Some(*v as i64),
            IrValue::I16(v) => Some(*v as i64),
            IrValue::I32(v) => Some(*v as i64),
            IrValue::I64(v) => Some(*v),
            IrValue::U8(v) => Some(*v as i64),
            IrValue::U16(v) => Some(*v as i64),
            IrValue::U32(v) => Some(*v as i64),
            IrValue::U64(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Interpret this value as an unsigned integer, if it is a non-negative
    /// integer.
    pub fn as_uint(&self) -> Option<u64> {
        self.as_int().and_then(|v| u64::try_from(v).ok())
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::Bool => write!(f, "bool"),
            IrType::I8 => write!(f, "i8"),
            IrType::I16 => write!(f, "i16"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::U8 => write!(f, "u8"),
            IrType::U16 => write!(f, "u16"),
            IrType::U32 => write!(f, "u32"),
            IrType::U64 => write!(f, "u64"),
            IrType::F32 => write!(f, "f32"),
            IrType::F64 => write!(f, "f64"),
            IrType::Ptr(ty) => write!(f, "*{}", ty),
            IrType::OpaquePtr => write!(f, "ptr"),
            IrType::Array(ty, size) => write!(f, "[{}; {}]", ty, size),
            IrType::Function {
                params,
                return_type,
                varargs,
            } => {
                write!(f, "fn(")?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                if *varargs {
                    write!(f, ", ...")?;
                }
                write!(f, ") -> {}", return_type)
            }
            IrType::Struct(name) => write!(f, "%{}", name),
        }
    }
}

impl fmt::Display for IrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrValue::Void => write!(f, "void"),
            IrValue::Undef => write!(f, "undef"),
            IrValue::Null => write!(f, "null"),
            IrValue::Bool(v) => write!(f, "{}", v),
            IrValue::I8(v) => write!(f, "{}", v),
            IrValue::I16(v) => write!(f, "{}", v),
            IrValue::I32(v) => write!(f, "{}", v),
            IrValue::I64(v) => write!(f, "{}", v),
            IrValue::U8(v) => write!(f, "{}", v),
            IrValue::U16(v) => write!(f, "{}", v),
            IrValue::U32(v) => write!(f, "{}", v),
            IrValue::U64(v) => write!(f, "{}", v),
            IrValue::F32(v) => write!(f, "{}", v),
            IrValue::F64(v) => write!(f, "{}", v),
            IrValue::Function(id) => write!(f, "@{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_display() {
        assert_eq!(format!("{}", IrType::I32), "i32");
        assert_eq!(format!("{}", IrType::I32.ptr_to()), "*i32");
        assert_eq!(format!("{}", IrType::U8.array_of(16)), "[u8; 16]");
        assert_eq!(format!("{}", IrType::Struct("simple".into())), "%simple");
    }

    #[test]
    fn test_type_properties() {
        assert!(IrType::I32.is_integer());
        assert!(IrType::F32.is_float());
        assert!(IrType::I32.ptr_to().is_pointer());
        assert!(IrType::OpaquePtr.is_pointer());
        assert_eq!(
            IrType::Struct("s".into()).array_of(3).array_of(2).strip_arrays(),
            &IrType::Struct("s".into())
        );
    }

    #[test]
    fn test_value_as_int() {
        assert_eq!(IrValue::I32(-3).as_int(), Some(-3));
        assert_eq!(IrValue::U64(24).as_uint(), Some(24));
        assert_eq!(IrValue::Null.as_int(), None);
        assert_eq!(IrValue::I32(-3).as_uint(), None);
    }
}

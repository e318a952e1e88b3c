//! Modules
//!
//! The top-level compilation unit: functions, external function
//! declarations, globals, and the named struct type table. Struct identity
//! is nominal; `IrType::Struct(name)` values reference entries in the table.

use super::{GepIndex, IrFunction, IrFunctionId, IrType, Linkage, POINTER_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A module - represents a compilation unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrModule {
    /// Module name
    pub name: String,

    /// Functions defined in this module
    pub functions: HashMap<IrFunctionId, IrFunction>,

    /// External function declarations
    pub extern_functions: HashMap<IrFunctionId, IrExternFunction>,

    /// Global variables
    pub globals: HashMap<IrGlobalId, IrGlobal>,

    /// Named struct types. BTreeMap so iteration order is deterministic.
    pub struct_types: BTreeMap<String, StructDef>,

    /// Next available IDs
    pub next_function_id: u32,
    pub next_global_id: u32,
}

/// Global variable identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrGlobalId(pub u32);

impl std::fmt::Display for IrGlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Global variable definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrGlobal {
    /// Global identifier
    pub id: IrGlobalId,

    /// Variable name
    pub name: String,

    /// Variable type
    pub ty: IrType,

    /// Linkage type
    pub linkage: Linkage,
}

/// Body of a named struct type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    /// Member types in declaration order
    pub members: Vec<IrType>,

    /// Whether this is a forward declaration with no body
    pub opaque: bool,
}

impl StructDef {
    pub fn new(members: Vec<IrType>) -> Self {
        Self {
            members,
            opaque: false,
        }
    }

    pub fn opaque() -> Self {
        Self {
            members: Vec::new(),
            opaque: true,
        }
    }
}

/// External function declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrExternFunction {
    /// Function ID
    pub id: IrFunctionId,

    /// Function name
    pub name: String,

    /// Function signature
    pub signature: super::IrFunctionSignature,
}

impl IrModule {
    /// Create a new module
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
            extern_functions: HashMap::new(),
            globals: HashMap::new(),
            struct_types: BTreeMap::new(),
            next_function_id: 0,
            next_global_id: 0,
        }
    }

    /// Add a function to the module
    pub fn add_function(&mut self, function: IrFunction) -> IrFunctionId {
        let id = function.id;
        self.functions.insert(id, function);
        self.next_function_id = self.next_function_id.max(id.0 + 1);
        id
    }

    /// Allocate a new function ID
    pub fn alloc_function_id(&mut self) -> IrFunctionId {
        let id = IrFunctionId(self.next_function_id);
        self.next_function_id += 1;
        id
    }

    /// Add an external function declaration
    pub fn add_extern_function(&mut self, extern_fn: IrExternFunction) -> IrFunctionId {
        let id = extern_fn.id;
        self.next_function_id = self.next_function_id.max(id.0 + 1);
        self.extern_functions.insert(id, extern_fn);
        id
    }

    /// Add a global variable
    pub fn add_global(&mut self, global: IrGlobal) -> IrGlobalId {
        let id = global.id;
        self.globals.insert(id, global);
        self.next_global_id = self.next_global_id.max(id.0 + 1);
        id
    }

    /// Allocate a new global ID
    pub fn alloc_global_id(&mut self) -> IrGlobalId {
        let id = IrGlobalId(self.next_global_id);
        self.next_global_id += 1;
        id
    }

    /// Define a named struct type, returning a reference to it.
    /// Defining a name that already exists replaces its body.
    pub fn define_struct(&mut self, name: impl Into<String>, members: Vec<IrType>) -> IrType {
        let name = name.into();
        self.struct_types
            .insert(name.clone(), StructDef::new(members));
        IrType::Struct(name)
    }

    /// Declare a named opaque struct (forward declaration). Idempotent; does
    /// not overwrite an existing body.
    pub fn declare_opaque_struct(&mut self, name: impl Into<String>) -> IrType {
        let name = name.into();
        self.struct_types
            .entry(name.clone())
            .or_insert_with(StructDef::opaque);
        IrType::Struct(name)
    }

    /// Replace the body of an existing named struct
    pub fn set_struct_body(&mut self, name: &str, members: Vec<IrType>) {
        self.struct_types
            .insert(name.to_string(), StructDef::new(members));
    }

    /// Look up a struct body by name
    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.struct_types.get(name)
    }

    /// Whether a struct with this name exists (opaque or not)
    pub fn has_struct(&self, name: &str) -> bool {
        self.struct_types.contains_key(name)
    }

    /// Names of all identified struct types, in deterministic order
    pub fn identified_structs(&self) -> impl Iterator<Item = &str> {
        self.struct_types.keys().map(|s| s.as_str())
    }

    /// Look up a defined function id by name
    pub fn function_id_by_name(&self, name: &str) -> Option<IrFunctionId> {
        self.functions
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| *id)
    }

    /// Look up an external declaration id by name
    pub fn extern_id_by_name(&self, name: &str) -> Option<IrFunctionId> {
        self.extern_functions
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| *id)
    }

    /// Name of a function or external declaration
    pub fn function_name(&self, id: IrFunctionId) -> Option<&str> {
        self.functions
            .get(&id)
            .map(|f| f.name.as_str())
            .or_else(|| self.extern_functions.get(&id).map(|f| f.name.as_str()))
    }

    /// Function ids of defined functions, sorted
    pub fn sorted_function_ids(&self) -> Vec<IrFunctionId> {
        let mut ids: Vec<_> = self.functions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Allocation size of a type in bytes. `None` for unsized types (void,
    /// function types, opaque structs). The layout model is padding-free:
    /// struct size is the plain sum of member sizes.
    pub fn alloc_size(&self, ty: &IrType) -> Option<u64> {
        match ty {
            IrType::Void | IrType::Function { .. } => None,
            IrType::Bool | IrType::I8 | IrType::U8 => Some(1),
            IrType::I16 | IrType::U16 => Some(2),
            IrType::I32 | IrType::U32 | IrType::F32 => Some(4),
            IrType::I64 | IrType::U64 | IrType::F64 => Some(8),
            IrType::Ptr(_) | IrType::OpaquePtr => Some(POINTER_SIZE),
            IrType::Array(elem, count) => Some(self.alloc_size(elem)? * (*count as u64)),
            IrType::Struct(name) => {
                let def = self.struct_def(name)?;
                if def.opaque {
                    return None;
                }
                let mut total = 0;
                for member in &def.members {
                    total += self.alloc_size(member)?;
                }
                Some(total)
            }
        }
    }

    /// Result type of an address computation: walk `indices` from a pointer
    /// to `source_ty` and re-wrap the final type in a pointer. `None` if the
    /// walk is not well-formed (e.g. a runtime index into a struct).
    pub fn gep_result_type(&self, source_ty: &IrType, indices: &[GepIndex]) -> Option<IrType> {
        let mut cur = source_ty.clone().ptr_to();
        for idx in indices {
            cur = match cur {
                IrType::Ptr(inner) => *inner,
                IrType::Array(elem, _) => *elem,
                IrType::Struct(name) => {
                    let member = match idx {
                        GepIndex::Const(i) => usize::try_from(*i).ok()?,
                        GepIndex::Reg(_) => return None,
                    };
                    self.struct_def(&name)?.members.get(member)?.clone()
                }
                _ => return None,
            };
        }
        Some(cur.ptr_to())
    }

    /// Verify module integrity
    pub fn verify(&self) -> Result<(), String> {
        for (id, function) in &self.functions {
            function
                .verify()
                .map_err(|e| format!("Function {} error: {}", id, e))?;
        }
        Ok(())
    }
}

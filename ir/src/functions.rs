//! Functions
//!
//! Function representation: signatures, parameters, the body CFG, and
//! per-register type information maintained alongside the instructions.

use super::{IrBlockId, IrControlFlowGraph, IrId, IrType, Linkage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A function with a body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrFunction {
    /// Unique identifier for this function
    pub id: IrFunctionId,

    /// Function name
    pub name: String,

    /// Function signature
    pub signature: IrFunctionSignature,

    /// Control flow graph (function body)
    pub cfg: IrControlFlowGraph,

    /// Type information for all registers (parameters and intermediate
    /// values)
    pub register_types: HashMap<IrId, IrType>,

    /// Linkage type
    pub linkage: Linkage,

    /// Classification of function origin
    pub kind: FunctionKind,

    /// Next available register ID
    pub next_reg_id: u32,
}

/// Unique identifier for functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrFunctionId(pub u32);

impl std::fmt::Display for IrFunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Function signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrFunctionSignature {
    /// Parameter types and names
    pub parameters: Vec<IrParameter>,

    /// Return type
    pub return_type: IrType,

    /// Whether this function takes variadic arguments
    pub varargs: bool,
}

impl IrFunctionSignature {
    /// The function type corresponding to this signature
    pub fn function_type(&self) -> IrType {
        IrType::Function {
            params: self.parameters.iter().map(|p| p.ty.clone()).collect(),
            return_type: Box::new(self.return_type.clone()),
            varargs: self.varargs,
        }
    }
}

/// Function parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrParameter {
    /// Parameter name
    pub name: String,

    /// Parameter type
    pub ty: IrType,

    /// Register assigned to this parameter
    pub reg: IrId,
}

/// Classification of function origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FunctionKind {
    /// Ordinary function from the input program
    #[default]
    UserDefined,
    /// Layout-conversion wrapper synthesized by a transformation
    Wrapper,
    /// Compiler intrinsic (skipped by transformations)
    Intrinsic,
}

impl IrFunction {
    /// Create a new function. Parameter registers are allocated here.
    pub fn new(id: IrFunctionId, name: String, signature: IrFunctionSignature) -> Self {
        let mut function = Self {
            id,
            name,
            signature,
            cfg: IrControlFlowGraph::new(),
            register_types: HashMap::new(),
            linkage: Linkage::Private,
            kind: FunctionKind::UserDefined,
            next_reg_id: 0,
        };

        let param_count = function.signature.parameters.len();
        for i in 0..param_count {
            let reg = function.alloc_reg();
            let param_ty = function.signature.parameters[i].ty.clone();
            function.signature.parameters[i].reg = reg;
            function.register_types.insert(reg, param_ty);
        }

        function
    }

    /// Allocate a new register
    pub fn alloc_reg(&mut self) -> IrId {
        let id = IrId::new(self.next_reg_id);
        self.next_reg_id += 1;
        id
    }

    /// Allocate a new register and record its type
    pub fn alloc_reg_typed(&mut self, ty: IrType) -> IrId {
        let id = self.alloc_reg();
        self.register_types.insert(id, ty);
        id
    }

    /// Get the entry block
    pub fn entry_block(&self) -> IrBlockId {
        self.cfg.entry_block
    }

    /// Get parameter register by index
    pub fn get_param_reg(&self, index: usize) -> Option<IrId> {
        self.signature.parameters.get(index).map(|p| p.reg)
    }

    /// Whether this function has a body
    pub fn has_body(&self) -> bool {
        !self.cfg.blocks.is_empty()
    }

    /// Verify function integrity
    pub fn verify(&self) -> Result<(), String> {
        // Emptied shells and declarations have no blocks to check
        if self.cfg.blocks.is_empty() {
            return Ok(());
        }

        self.cfg.verify()?;

        if let Some(entry) = self.cfg.get_block(self.cfg.entry_block) {
            if !entry.phi_nodes.is_empty() {
                return Err("Entry block cannot have phi nodes".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(params: Vec<(&str, IrType)>, ret: IrType) -> IrFunctionSignature {
        IrFunctionSignature {
            parameters: params
                .into_iter()
                .map(|(name, ty)| IrParameter {
                    name: name.to_string(),
                    ty,
                    reg: IrId::invalid(),
                })
                .collect(),
            return_type: ret,
            varargs: false,
        }
    }

    #[test]
    fn test_function_creation() {
        let func = IrFunction::new(
            IrFunctionId(1),
            "add".to_string(),
            sig(vec![("x", IrType::I32), ("y", IrType::I32)], IrType::I32),
        );

        assert_eq!(func.name, "add");
        assert_eq!(func.signature.parameters.len(), 2);
        assert_ne!(
            func.signature.parameters[0].reg,
            func.signature.parameters[1].reg
        );
        assert_eq!(
            func.register_types[&func.signature.parameters[0].reg],
            IrType::I32
        );
    }

    #[test]
    fn test_function_type() {
        let func = IrFunction::new(
            IrFunctionId(2),
            "id".to_string(),
            sig(vec![("p", IrType::I64.ptr_to())], IrType::I64.ptr_to()),
        );
        assert_eq!(
            func.signature.function_type(),
            IrType::Function {
                params: vec![IrType::I64.ptr_to()],
                return_type: Box::new(IrType::I64.ptr_to()),
                varargs: false,
            }
        );
    }
}

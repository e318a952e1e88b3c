//! Module Builder - programmatic construction of IR modules
//!
//! Provides a builder API for constructing modules without a frontend,
//! used by embedders and throughout the test suites.
//!
//! # Example
//!
//! ```rust
//! use ir::{BinaryOp, IrType, ModuleBuilder};
//!
//! let mut b = ModuleBuilder::new("demo");
//!
//! let func = b
//!     .begin_function("add")
//!     .param("x", IrType::I32)
//!     .param("y", IrType::I32)
//!     .returns(IrType::I32)
//!     .build();
//! b.set_current_function(func);
//!
//! let entry = b.create_block("entry");
//! b.set_insert_point(entry);
//! let x = b.param(0);
//! let y = b.param(1);
//! let sum = b.bin_op(BinaryOp::Add, x, y, IrType::I32);
//! b.ret(Some(sum));
//!
//! let module = b.finish();
//! assert!(module.verify().is_ok());
//! ```

use super::{
    BinaryOp, CompareOp, FunctionKind, GepIndex, IrBlockId, IrExternFunction, IrFunction,
    IrFunctionId, IrFunctionSignature, IrGlobal, IrGlobalId, IrId, IrInstruction, IrModule,
    IrParameter, IrPhiNode, IrTerminator, IrType, IrValue, Linkage,
};

/// Builder for programmatically constructing IR modules
pub struct ModuleBuilder {
    /// Module being built
    module: IrModule,

    /// Current function being built
    current_function: Option<IrFunctionId>,

    /// Current block being built
    current_block: Option<IrBlockId>,
}

/// Builder for function signatures
pub struct FunctionBuilder<'a> {
    builder: &'a mut ModuleBuilder,
    name: String,
    params: Vec<IrParameter>,
    return_type: IrType,
    varargs: bool,
    linkage: Linkage,
    kind: FunctionKind,
}

impl<'a> FunctionBuilder<'a> {
    /// Add a parameter
    pub fn param(mut self, name: impl Into<String>, ty: IrType) -> Self {
        self.params.push(IrParameter {
            name: name.into(),
            ty,
            reg: IrId::invalid(),
        });
        self
    }

    /// Set the return type
    pub fn returns(mut self, ty: IrType) -> Self {
        self.return_type = ty;
        self
    }

    /// Set varargs
    pub fn varargs(mut self, varargs: bool) -> Self {
        self.varargs = varargs;
        self
    }

    /// Set the linkage
    pub fn linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    /// Set the function kind
    pub fn kind(mut self, kind: FunctionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Finish the signature and add the function to the module
    pub fn build(self) -> IrFunctionId {
        let id = self.builder.module.alloc_function_id();
        let mut function = IrFunction::new(
            id,
            self.name,
            IrFunctionSignature {
                parameters: self.params,
                return_type: self.return_type,
                varargs: self.varargs,
            },
        );
        function.linkage = self.linkage;
        function.kind = self.kind;
        self.builder.module.add_function(function);
        id
    }
}

impl ModuleBuilder {
    /// Create a new builder for a fresh module
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module: IrModule::new(module_name),
            current_function: None,
            current_block: None,
        }
    }

    /// Access the module under construction
    pub fn module(&self) -> &IrModule {
        &self.module
    }

    /// Finish building and take the module
    pub fn finish(self) -> IrModule {
        self.module
    }

    // === Types and module-level entities ===

    /// Define a named struct type
    pub fn define_struct(&mut self, name: impl Into<String>, members: Vec<IrType>) -> IrType {
        self.module.define_struct(name, members)
    }

    /// Declare a named opaque struct
    pub fn declare_opaque_struct(&mut self, name: impl Into<String>) -> IrType {
        self.module.declare_opaque_struct(name)
    }

    /// Declare an external function
    pub fn declare_extern(
        &mut self,
        name: impl Into<String>,
        params: Vec<IrType>,
        return_type: IrType,
    ) -> IrFunctionId {
        let id = self.module.alloc_function_id();
        self.module.add_extern_function(IrExternFunction {
            id,
            name: name.into(),
            signature: IrFunctionSignature {
                parameters: params
                    .into_iter()
                    .enumerate()
                    .map(|(i, ty)| IrParameter {
                        name: format!("a{}", i),
                        ty,
                        reg: IrId::invalid(),
                    })
                    .collect(),
                return_type,
                varargs: false,
            },
        })
    }

    /// Define a module global
    pub fn define_global(&mut self, name: impl Into<String>, ty: IrType) -> IrGlobalId {
        let id = self.module.alloc_global_id();
        self.module.add_global(IrGlobal {
            id,
            name: name.into(),
            ty,
            linkage: Linkage::Internal,
        });
        id
    }

    // === Functions and blocks ===

    /// Begin defining a new function
    pub fn begin_function(&mut self, name: impl Into<String>) -> FunctionBuilder {
        FunctionBuilder {
            builder: self,
            name: name.into(),
            params: Vec::new(),
            return_type: IrType::Void,
            varargs: false,
            linkage: Linkage::Public,
            kind: FunctionKind::UserDefined,
        }
    }

    /// Set the current function being built
    pub fn set_current_function(&mut self, func_id: IrFunctionId) {
        self.current_function = Some(func_id);
        self.current_block = None;
    }

    fn current_func(&self) -> &IrFunction {
        let func_id = self.current_function.expect("No current function");
        self.module
            .functions
            .get(&func_id)
            .expect("Function not found")
    }

    fn current_func_mut(&mut self) -> &mut IrFunction {
        let func_id = self.current_function.expect("No current function");
        self.module
            .functions
            .get_mut(&func_id)
            .expect("Function not found")
    }

    /// Create a new basic block in the current function. The first call
    /// labels and reuses the existing entry block.
    pub fn create_block(&mut self, label: impl Into<String>) -> IrBlockId {
        let func = self.current_func_mut();

        if func.cfg.blocks.len() == 1 {
            let entry = func.cfg.entry_block;
            if let Some(block) = func.cfg.blocks.get_mut(&entry) {
                if block.label.is_none() && block.instructions.is_empty() {
                    block.label = Some(label.into());
                    return entry;
                }
            }
        }

        let id = func.cfg.create_block();
        func.cfg.get_block_mut(id).unwrap().label = Some(label.into());
        id
    }

    /// Set the insertion point to a specific block
    pub fn set_insert_point(&mut self, block_id: IrBlockId) {
        self.current_block = Some(block_id);
    }

    /// Get parameter register by index
    pub fn param(&self, index: usize) -> IrId {
        self.current_func()
            .get_param_reg(index)
            .expect("Parameter index out of bounds")
    }

    /// Get the recorded type of a register
    pub fn register_type(&self, reg: IrId) -> Option<IrType> {
        self.current_func().register_types.get(&reg).cloned()
    }

    fn insert_inst(&mut self, inst: IrInstruction) {
        let block_id = self.current_block.expect("No current block");
        let func = self.current_func_mut();
        let block = func
            .cfg
            .get_block_mut(block_id)
            .expect("Block not found");
        block.instructions.push(inst);
    }

    fn alloc_reg_typed(&mut self, ty: IrType) -> IrId {
        self.current_func_mut().alloc_reg_typed(ty)
    }

    // === Instructions ===

    /// Materialize a constant. The type is recorded for the destination
    /// register (needed for typed `Null` and integer width).
    pub fn const_val(&mut self, value: IrValue, ty: IrType) -> IrId {
        let dest = self.alloc_reg_typed(ty);
        self.insert_inst(IrInstruction::Const { dest, value });
        dest
    }

    /// Convenience: i32 constant
    pub fn const_i32(&mut self, value: i32) -> IrId {
        self.const_val(IrValue::I32(value), IrType::I32)
    }

    /// Convenience: u64 constant
    pub fn const_u64(&mut self, value: u64) -> IrId {
        self.const_val(IrValue::U64(value), IrType::U64)
    }

    /// Binary operation
    pub fn bin_op(&mut self, op: BinaryOp, left: IrId, right: IrId, ty: IrType) -> IrId {
        let dest = self.alloc_reg_typed(ty);
        self.insert_inst(IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    /// Comparison
    pub fn cmp(&mut self, op: CompareOp, left: IrId, right: IrId) -> IrId {
        let dest = self.alloc_reg_typed(IrType::Bool);
        self.insert_inst(IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    /// Stack allocation; returns a pointer to `ty`
    pub fn alloca(&mut self, ty: IrType) -> IrId {
        let dest = self.alloc_reg_typed(ty.clone().ptr_to());
        self.insert_inst(IrInstruction::Alloca {
            dest,
            ty,
            count: None,
        });
        dest
    }

    /// Stack allocation of `count` elements
    pub fn alloca_array(&mut self, ty: IrType, count: IrId) -> IrId {
        let dest = self.alloc_reg_typed(ty.clone().ptr_to());
        self.insert_inst(IrInstruction::Alloca {
            dest,
            ty,
            count: Some(count),
        });
        dest
    }

    /// Load a value of `ty` through `ptr`
    pub fn load(&mut self, ptr: IrId, ty: IrType) -> IrId {
        let dest = self.alloc_reg_typed(ty.clone());
        self.insert_inst(IrInstruction::Load { dest, ptr, ty });
        dest
    }

    /// Store `value` through `ptr`
    pub fn store(&mut self, ptr: IrId, value: IrId) {
        self.insert_inst(IrInstruction::Store { ptr, value });
    }

    /// Address computation. The destination type is derived from the walk.
    pub fn gep(&mut self, ptr: IrId, source_ty: IrType, indices: Vec<GepIndex>) -> IrId {
        let result_ty = self
            .module
            .gep_result_type(&source_ty, &indices)
            .expect("Ill-formed GEP");
        let dest = self.alloc_reg_typed(result_ty);
        self.insert_inst(IrInstruction::GetElementPtr {
            dest,
            ptr,
            source_ty,
            indices,
        });
        dest
    }

    /// Pointer reinterpretation
    pub fn bitcast(&mut self, src: IrId, to_ty: IrType) -> IrId {
        let dest = self.alloc_reg_typed(to_ty.clone());
        self.insert_inst(IrInstruction::BitCast { dest, src, to_ty });
        dest
    }

    /// Value cast
    pub fn cast(&mut self, src: IrId, from_ty: IrType, to_ty: IrType) -> IrId {
        let dest = self.alloc_reg_typed(to_ty.clone());
        self.insert_inst(IrInstruction::Cast {
            dest,
            src,
            from_ty,
            to_ty,
        });
        dest
    }

    /// Direct call. Returns the destination register when `return_type` is
    /// non-void.
    pub fn call(
        &mut self,
        func_id: IrFunctionId,
        args: Vec<IrId>,
        return_type: IrType,
    ) -> Option<IrId> {
        let dest = if return_type == IrType::Void {
            None
        } else {
            Some(self.alloc_reg_typed(return_type))
        };
        self.insert_inst(IrInstruction::CallDirect {
            dest,
            func_id,
            args,
        });
        dest
    }

    /// Indirect call through a function pointer
    pub fn call_indirect(
        &mut self,
        func_ptr: IrId,
        args: Vec<IrId>,
        signature: IrType,
    ) -> Option<IrId> {
        let return_type = match &signature {
            IrType::Function { return_type, .. } => (**return_type).clone(),
            _ => panic!("call_indirect requires a function type signature"),
        };
        let dest = if return_type == IrType::Void {
            None
        } else {
            Some(self.alloc_reg_typed(return_type))
        };
        self.insert_inst(IrInstruction::CallIndirect {
            dest,
            func_ptr,
            args,
            signature,
        });
        dest
    }

    /// Take the address of a function
    pub fn function_ref(&mut self, func_id: IrFunctionId, fn_ty: IrType) -> IrId {
        let dest = self.alloc_reg_typed(fn_ty.ptr_to());
        self.insert_inst(IrInstruction::FunctionRef { dest, func_id });
        dest
    }

    /// Take the address of a global
    pub fn global_addr(&mut self, global_id: IrGlobalId) -> IrId {
        let ty = self
            .module
            .globals
            .get(&global_id)
            .expect("Global not found")
            .ty
            .clone();
        let dest = self.alloc_reg_typed(ty.ptr_to());
        self.insert_inst(IrInstruction::GlobalAddr { dest, global_id });
        dest
    }

    /// Memory copy
    pub fn mem_copy(&mut self, dest: IrId, src: IrId, size: IrId) {
        self.insert_inst(IrInstruction::MemCopy { dest, src, size });
    }

    /// Add a phi node to the current block
    pub fn phi(&mut self, ty: IrType, incoming: Vec<(IrBlockId, IrId)>) -> IrId {
        let dest = self.alloc_reg_typed(ty.clone());
        let block_id = self.current_block.expect("No current block");
        let func = self.current_func_mut();
        func.cfg
            .get_block_mut(block_id)
            .expect("Block not found")
            .add_phi(IrPhiNode { dest, incoming, ty });
        dest
    }

    // === Terminators ===

    fn set_terminator(&mut self, term: IrTerminator) {
        let block_id = self.current_block.expect("No current block");
        let func = self.current_func_mut();
        func.cfg
            .get_block_mut(block_id)
            .expect("Block not found")
            .set_terminator(term);
    }

    /// Return from the current function
    pub fn ret(&mut self, value: Option<IrId>) {
        self.set_terminator(IrTerminator::Return { value });
    }

    /// Unconditional branch
    pub fn br(&mut self, target: IrBlockId) {
        let from = self.current_block.expect("No current block");
        self.set_terminator(IrTerminator::Branch { target });
        self.current_func_mut().cfg.connect_blocks(from, target);
    }

    /// Conditional branch
    pub fn cond_br(&mut self, condition: IrId, true_target: IrBlockId, false_target: IrBlockId) {
        let from = self.current_block.expect("No current block");
        self.set_terminator(IrTerminator::CondBranch {
            condition,
            true_target,
            false_target,
        });
        let func = self.current_func_mut();
        func.cfg.connect_blocks(from, true_target);
        func.cfg.connect_blocks(from, false_target);
    }
}

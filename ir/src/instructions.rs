//! IR Instructions
//!
//! Instructions are low-level operations that map directly to machine
//! operations. Control transfer lives in block terminators
//! ([`super::IrTerminator`]); phi nodes live at block heads
//! ([`super::IrPhiNode`]).

use super::{IrFunctionId, IrGlobalId, IrId, IrType, IrValue};
use serde::{Deserialize, Serialize};

/// An index operand of a `GetElementPtr` instruction.
///
/// Struct member indices must be compile-time constants; array and pointer
/// strides may be computed at runtime. Keeping constants inline (instead of
/// routing them through `Const` registers) lets address computations be
/// rewritten without materializing new registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GepIndex {
    /// Inline constant index
    Const(i64),
    /// Runtime index held in a register
    Reg(IrId),
}

/// IR instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IrInstruction {
    /// Load constant value
    Const { dest: IrId, value: IrValue },

    /// Binary arithmetic operation
    BinOp {
        dest: IrId,
        op: BinaryOp,
        left: IrId,
        right: IrId,
    },

    /// Compare operation
    Cmp {
        dest: IrId,
        op: CompareOp,
        left: IrId,
        right: IrId,
    },

    /// Stack allocation of `count` elements of `ty` (one element if `None`)
    Alloca {
        dest: IrId,
        ty: IrType,
        count: Option<IrId>,
    },

    /// Load value from memory
    Load { dest: IrId, ptr: IrId, ty: IrType },

    /// Store value to memory
    Store { ptr: IrId, value: IrId },

    /// Compute the address of an element or member.
    ///
    /// `source_ty` is the type the base pointer is interpreted as pointing
    /// to; the first index strides over whole `source_ty` elements,
    /// subsequent indices walk into aggregates.
    GetElementPtr {
        dest: IrId,
        ptr: IrId,
        source_ty: IrType,
        indices: Vec<GepIndex>,
    },

    /// Reinterpret a pointer as pointing to a different type
    BitCast { dest: IrId, src: IrId, to_ty: IrType },

    /// Value cast (integer resize, pointer/integer conversion)
    Cast {
        dest: IrId,
        src: IrId,
        from_ty: IrType,
        to_ty: IrType,
    },

    /// Direct function call (callee known at compile time)
    CallDirect {
        dest: Option<IrId>,
        func_id: IrFunctionId,
        args: Vec<IrId>,
    },

    /// Indirect function call through a function pointer
    CallIndirect {
        dest: Option<IrId>,
        func_ptr: IrId,
        args: Vec<IrId>,
        /// Function type the callee is invoked at
        signature: IrType,
    },

    /// Function reference (for function pointers)
    FunctionRef { dest: IrId, func_id: IrFunctionId },

    /// Address of a module global
    GlobalAddr { dest: IrId, global_id: IrGlobalId },

    /// Memory copy of `size` bytes
    MemCopy { dest: IrId, src: IrId, size: IrId },
}

/// Binary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Comparison operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    ULt,
    ULe,
    UGt,
    UGe,
}

impl IrInstruction {
    /// Get the destination register if this instruction produces a value
    pub fn dest(&self) -> Option<IrId> {
        match self {
            IrInstruction::Const { dest, .. }
            | IrInstruction::BinOp { dest, .. }
            | IrInstruction::Cmp { dest, .. }
            | IrInstruction::Alloca { dest, .. }
            | IrInstruction::Load { dest, .. }
            | IrInstruction::GetElementPtr { dest, .. }
            | IrInstruction::BitCast { dest, .. }
            | IrInstruction::Cast { dest, .. }
            | IrInstruction::FunctionRef { dest, .. }
            | IrInstruction::GlobalAddr { dest, .. } => Some(*dest),

            IrInstruction::CallDirect { dest, .. } | IrInstruction::CallIndirect { dest, .. } => {
                *dest
            }

            IrInstruction::Store { .. } | IrInstruction::MemCopy { .. } => None,
        }
    }

    /// Get all registers read by this instruction
    pub fn uses(&self) -> Vec<IrId> {
        match self {
            IrInstruction::Const { .. }
            | IrInstruction::FunctionRef { .. }
            | IrInstruction::GlobalAddr { .. } => vec![],
            IrInstruction::BinOp { left, right, .. } | IrInstruction::Cmp { left, right, .. } => {
                vec![*left, *right]
            }
            IrInstruction::Alloca { count, .. } => count.map(|c| vec![c]).unwrap_or_default(),
            IrInstruction::Load { ptr, .. } => vec![*ptr],
            IrInstruction::Store { ptr, value } => vec![*ptr, *value],
            IrInstruction::GetElementPtr { ptr, indices, .. } => {
                let mut uses = vec![*ptr];
                for idx in indices {
                    if let GepIndex::Reg(reg) = idx {
                        uses.push(*reg);
                    }
                }
                uses
            }
            IrInstruction::BitCast { src, .. } | IrInstruction::Cast { src, .. } => vec![*src],
            IrInstruction::CallDirect { args, .. } => args.clone(),
            IrInstruction::CallIndirect { func_ptr, args, .. } => {
                let mut uses = vec![*func_ptr];
                uses.extend(args);
                uses
            }
            IrInstruction::MemCopy { dest, src, size } => vec![*dest, *src, *size],
        }
    }

    /// Redirect every read of `from` to `to`. Destinations are untouched.
    pub fn replace_uses(&mut self, from: IrId, to: IrId) {
        let patch = |reg: &mut IrId| {
            if *reg == from {
                *reg = to;
            }
        };
        match self {
            IrInstruction::Const { .. }
            | IrInstruction::FunctionRef { .. }
            | IrInstruction::GlobalAddr { .. } => {}
            IrInstruction::BinOp { left, right, .. } | IrInstruction::Cmp { left, right, .. } => {
                patch(left);
                patch(right);
            }
            IrInstruction::Alloca { count, .. } => {
                if let Some(count) = count {
                    patch(count);
                }
            }
            IrInstruction::Load { ptr, .. } => patch(ptr),
            IrInstruction::Store { ptr, value } => {
                patch(ptr);
                patch(value);
            }
            IrInstruction::GetElementPtr { ptr, indices, .. } => {
                patch(ptr);
                for idx in indices {
                    if let GepIndex::Reg(reg) = idx {
                        patch(reg);
                    }
                }
            }
            IrInstruction::BitCast { src, .. } | IrInstruction::Cast { src, .. } => patch(src),
            IrInstruction::CallDirect { args, .. } => args.iter_mut().for_each(patch),
            IrInstruction::CallIndirect { func_ptr, args, .. } => {
                patch(func_ptr);
                args.iter_mut().for_each(patch);
            }
            IrInstruction::MemCopy { dest, src, size } => {
                patch(dest);
                patch(src);
                patch(size);
            }
        }
    }

    /// Check if this instruction has side effects
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            IrInstruction::Alloca { .. }
                | IrInstruction::Store { .. }
                | IrInstruction::CallDirect { .. }
                | IrInstruction::CallIndirect { .. }
                | IrInstruction::MemCopy { .. }
        )
    }
}

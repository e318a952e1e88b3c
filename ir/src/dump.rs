//! IR Dump Utility
//!
//! Pretty-prints modules in a human-readable format. Output is
//! deterministic (entities sorted by id/name), which makes it usable both
//! for debugging snapshots and for golden assertions in tests.

use super::{
    BinaryOp, CompareOp, GepIndex, IrBasicBlock, IrFunction, IrInstruction, IrModule, IrPhiNode,
    IrTerminator,
};
use std::fmt::Write;

/// Dump an entire module to a string.
pub fn dump_module(module: &IrModule) -> String {
    let mut out = String::new();
    writeln!(out, "; Module: {}", module.name).unwrap();
    writeln!(out).unwrap();

    for name in module.identified_structs() {
        let def = module.struct_def(name).unwrap();
        if def.opaque {
            writeln!(out, "%{} = type opaque", name).unwrap();
        } else {
            let members: Vec<String> = def.members.iter().map(|m| format!("{}", m)).collect();
            writeln!(out, "%{} = type {{ {} }}", name, members.join(", ")).unwrap();
        }
    }
    if !module.struct_types.is_empty() {
        writeln!(out).unwrap();
    }

    let mut global_ids: Vec<_> = module.globals.keys().copied().collect();
    global_ids.sort();
    for id in &global_ids {
        let global = &module.globals[id];
        writeln!(out, "@{} = global {} ; {}", global.name, global.ty, id).unwrap();
    }
    if !global_ids.is_empty() {
        writeln!(out).unwrap();
    }

    let mut extern_ids: Vec<_> = module.extern_functions.keys().copied().collect();
    extern_ids.sort();
    for id in &extern_ids {
        let ext = &module.extern_functions[id];
        let params: Vec<String> = ext
            .signature
            .parameters
            .iter()
            .map(|p| format!("{}", p.ty))
            .collect();
        writeln!(
            out,
            "declare @{}({}) -> {}",
            ext.name,
            params.join(", "),
            ext.signature.return_type
        )
        .unwrap();
    }
    if !extern_ids.is_empty() {
        writeln!(out).unwrap();
    }

    for func_id in module.sorted_function_ids() {
        writeln!(out, "{}", dump_function(&module.functions[&func_id])).unwrap();
    }

    out
}

/// Dump a single function to a string.
pub fn dump_function(func: &IrFunction) -> String {
    let mut out = String::new();

    let params: Vec<String> = func
        .signature
        .parameters
        .iter()
        .map(|p| format!("{}: {}", p.reg, p.ty))
        .collect();

    writeln!(
        out,
        "fn @{}({}) -> {} {{",
        func.name,
        params.join(", "),
        func.signature.return_type
    )
    .unwrap();

    for block_id in func.cfg.sorted_block_ids() {
        write!(out, "{}", dump_block(&func.cfg.blocks[&block_id])).unwrap();
    }

    writeln!(out, "}}").unwrap();
    out
}

/// Dump a basic block to a string.
pub fn dump_block(block: &IrBasicBlock) -> String {
    let mut out = String::new();

    let label = block
        .label
        .as_ref()
        .map(|l| format!(" ; {}", l))
        .unwrap_or_default();
    writeln!(out, "  {}:{}", block.id, label).unwrap();

    if !block.predecessors.is_empty() {
        let preds: Vec<String> = block.predecessors.iter().map(|p| format!("{}", p)).collect();
        writeln!(out, "    ; preds: {}", preds.join(", ")).unwrap();
    }

    for phi in &block.phi_nodes {
        writeln!(out, "    {}", dump_phi(phi)).unwrap();
    }

    for inst in &block.instructions {
        writeln!(out, "    {}", dump_instruction(inst)).unwrap();
    }

    writeln!(out, "    {}", dump_terminator(&block.terminator)).unwrap();

    out
}

/// Dump a phi node to a string.
pub fn dump_phi(phi: &IrPhiNode) -> String {
    let incoming: Vec<String> = phi
        .incoming
        .iter()
        .map(|(block, val)| format!("[{}: {}]", block, val))
        .collect();
    format!("{} = phi {} {}", phi.dest, phi.ty, incoming.join(", "))
}

/// Dump a terminator to a string.
pub fn dump_terminator(term: &IrTerminator) -> String {
    match term {
        IrTerminator::Branch { target } => format!("br {}", target),
        IrTerminator::CondBranch {
            condition,
            true_target,
            false_target,
        } => format!("br {} ? {} : {}", condition, true_target, false_target),
        IrTerminator::Return { value: Some(v) } => format!("ret {}", v),
        IrTerminator::Return { value: None } => "ret".to_string(),
        IrTerminator::Unreachable => "unreachable".to_string(),
    }
}

fn dump_gep_index(idx: &GepIndex) -> String {
    match idx {
        GepIndex::Const(i) => format!("{}", i),
        GepIndex::Reg(reg) => format!("{}", reg),
    }
}

/// Dump an instruction to a string.
pub fn dump_instruction(inst: &IrInstruction) -> String {
    match inst {
        IrInstruction::Const { dest, value } => format!("{} = const {}", dest, value),
        IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        } => format!("{} = {} {}, {}", dest, dump_binop(*op), left, right),
        IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        } => format!("{} = cmp.{} {}, {}", dest, dump_cmpop(*op), left, right),
        IrInstruction::Alloca { dest, ty, count } => match count {
            Some(count) => format!("{} = alloca {}, count {}", dest, ty, count),
            None => format!("{} = alloca {}", dest, ty),
        },
        IrInstruction::Load { dest, ptr, ty } => format!("{} = load {}, {}", dest, ty, ptr),
        IrInstruction::Store { ptr, value } => format!("store {}, {}", value, ptr),
        IrInstruction::GetElementPtr {
            dest,
            ptr,
            source_ty,
            indices,
        } => {
            let idx: Vec<String> = indices.iter().map(dump_gep_index).collect();
            format!("{} = gep {}, {} [{}]", dest, source_ty, ptr, idx.join(", "))
        }
        IrInstruction::BitCast { dest, src, to_ty } => {
            format!("{} = bitcast {} to {}", dest, src, to_ty)
        }
        IrInstruction::Cast {
            dest,
            src,
            from_ty,
            to_ty,
        } => format!("{} = cast {} from {} to {}", dest, src, from_ty, to_ty),
        IrInstruction::CallDirect {
            dest,
            func_id,
            args,
        } => {
            let args: Vec<String> = args.iter().map(|a| format!("{}", a)).collect();
            match dest {
                Some(dest) => format!("{} = call {}({})", dest, func_id, args.join(", ")),
                None => format!("call {}({})", func_id, args.join(", ")),
            }
        }
        IrInstruction::CallIndirect {
            dest,
            func_ptr,
            args,
            signature,
        } => {
            let args: Vec<String> = args.iter().map(|a| format!("{}", a)).collect();
            match dest {
                Some(dest) => format!(
                    "{} = call_indirect {} as {}({})",
                    dest,
                    func_ptr,
                    signature,
                    args.join(", ")
                ),
                None => format!(
                    "call_indirect {} as {}({})",
                    func_ptr,
                    signature,
                    args.join(", ")
                ),
            }
        }
        IrInstruction::FunctionRef { dest, func_id } => {
            format!("{} = funcref {}", dest, func_id)
        }
        IrInstruction::GlobalAddr { dest, global_id } => {
            format!("{} = globaladdr {}", dest, global_id)
        }
        IrInstruction::MemCopy { dest, src, size } => {
            format!("memcopy {} <- {}, {}", dest, src, size)
        }
    }
}

fn dump_binop(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Rem => "rem",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
    }
}

fn dump_cmpop(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "eq",
        CompareOp::Ne => "ne",
        CompareOp::Lt => "lt",
        CompareOp::Le => "le",
        CompareOp::Gt => "gt",
        CompareOp::Ge => "ge",
        CompareOp::ULt => "ult",
        CompareOp::ULe => "ule",
        CompareOp::UGt => "ugt",
        CompareOp::UGe => "uge",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IrType, IrValue, ModuleBuilder};

    #[test]
    fn test_dump_contains_types_and_functions() {
        let mut b = ModuleBuilder::new("demo");
        b.define_struct("simple", vec![IrType::I32, IrType::I8.array_of(2)]);
        let func = b.begin_function("main").returns(IrType::I32).build();
        b.set_current_function(func);
        let entry = b.create_block("entry");
        b.set_insert_point(entry);
        let zero = b.const_i32(0);
        b.ret(Some(zero));

        let text = dump_module(&b.finish());
        assert!(text.contains("%simple = type { i32, [i8; 2] }"));
        assert!(text.contains("fn @main()"));
        assert!(text.contains("ret"));
    }

    #[test]
    fn test_dump_value_formats() {
        assert_eq!(format!("{}", IrValue::Null), "null");
        assert_eq!(format!("{}", IrValue::U64(24)), "24");
    }
}

//! Instruction rewriting
//!
//! Rewrites every instruction that references an original struct type to
//! use the inflated layout: stack allocations, member address
//! computations, pointer bitcasts (with allocator size scaling), loads of
//! struct pointers, phi nodes, and indirect call signatures.
//!
//! Rewriting happens in two stages per function. A read-only **scan**
//! walks the body and records every required change in deferred update
//! queues, so no instruction list is modified while it is being iterated.
//! An **apply** stage then drains the queues: in-place type/index updates
//! first, then insertions of rescaled allocator size constants, and phi
//! retyping strictly last (phis close cycles in the value graph, so they
//! are finalized only after every other rewrite of the function is known).

use crate::error::TransformError;
use crate::inflate::inflated_type;
use crate::layout::{StructInfo, StructMap};
use fxhash::FxHashMap;
use ir::dump::dump_instruction;
use ir::{
    GepIndex, IrBlockId, IrFunction, IrFunctionId, IrId, IrInstruction, IrType, IrValue,
};
use log::{debug, trace};
use std::rc::Rc;

/// A heap allocation site whose element type was inflated. The hook
/// emitter registers `count * |redzones|` redzones at this site.
#[derive(Debug, Clone)]
pub struct HeapSite {
    /// Destination of the bitcast that types the allocation
    pub ptr: IrId,

    /// Layout record of the allocated struct
    pub info: Rc<StructInfo>,

    /// Number of allocated elements
    pub count: u64,
}

type Loc = (IrBlockId, usize);

/// One deferred in-place instruction update.
enum InstUpdate {
    Alloca { loc: Loc, ty: IrType },
    Gep {
        loc: Loc,
        source_ty: IrType,
        indices: Vec<GepIndex>,
    },
    BitCast { loc: Loc, to_ty: IrType },
    Load { loc: Loc, ty: IrType },
    IndirectSignature { loc: Loc, signature: IrType },
}

/// Rescaled size argument of an allocator call. Applying this inserts a
/// fresh constant immediately before the call and redirects the argument.
struct SizeArgUpdate {
    loc: Loc,
    arg_index: usize,
    value: IrValue,
}

/// A phi whose type inflates. Finalized after all other rewrites.
struct PendingPhi {
    block: IrBlockId,
    index: usize,
    ty: IrType,
}

/// All deferred updates for one function.
pub struct FunctionUpdates {
    in_place: Vec<InstUpdate>,
    size_args: Vec<SizeArgUpdate>,
    pending_phis: Vec<PendingPhi>,
    reg_types: Vec<(IrId, IrType)>,
    heap_sites: Vec<HeapSite>,
}

impl FunctionUpdates {
    pub fn is_empty(&self) -> bool {
        self.in_place.is_empty() && self.size_args.is_empty() && self.pending_phis.is_empty()
    }

    /// Number of rewritten instructions and phis
    pub fn rewrite_count(&self) -> usize {
        self.in_place.len() + self.size_args.len() + self.pending_phis.len()
    }
}

/// Rewrite one function body. `callee_names` resolves function ids to
/// symbol names (needed to recognize allocator calls). Returns the heap
/// allocation sites discovered for the hook emitter.
pub fn rewrite_function(
    func: &mut IrFunction,
    map: &StructMap,
    callee_names: &FxHashMap<IrFunctionId, String>,
) -> Result<Vec<HeapSite>, TransformError> {
    let updates = scan_function(func, map, callee_names)?;
    if !updates.is_empty() {
        debug!(
            "rewriting {}: {} instruction updates",
            func.name,
            updates.rewrite_count()
        );
    }
    Ok(apply_updates(func, updates))
}

/// Size-argument position of a recognized allocator, by symbol name.
/// Transformed twins of allocators keep their allocator role.
fn allocator_size_arg(name: &str) -> Option<usize> {
    let base = name.strip_suffix(crate::INFLATED_SUFFIX).unwrap_or(name);
    match base {
        "malloc" => Some(0),
        "calloc" | "realloc" => Some(1),
        _ => None,
    }
}

fn scan_function(
    func: &IrFunction,
    map: &StructMap,
    callee_names: &FxHashMap<IrFunctionId, String>,
) -> Result<FunctionUpdates, TransformError> {
    let mut updates = FunctionUpdates {
        in_place: Vec::new(),
        size_args: Vec::new(),
        pending_phis: Vec::new(),
        reg_types: Vec::new(),
        heap_sites: Vec::new(),
    };

    // Constant definitions and definition sites, function-wide (SSA: one
    // definition per register).
    let mut const_defs: FxHashMap<IrId, IrValue> = FxHashMap::default();
    let mut def_sites: FxHashMap<IrId, Loc> = FxHashMap::default();
    for block_id in func.cfg.sorted_block_ids() {
        let block = &func.cfg.blocks[&block_id];
        for (i, inst) in block.instructions.iter().enumerate() {
            if let IrInstruction::Const { dest, value } = inst {
                const_defs.insert(*dest, value.clone());
            }
            if let Some(dest) = inst.dest() {
                def_sites.insert(dest, (block_id, i));
            }
        }
    }

    for block_id in func.cfg.sorted_block_ids() {
        let block = &func.cfg.blocks[&block_id];

        for (index, phi) in block.phi_nodes.iter().enumerate() {
            let (ty, changed) = inflated_type(map, &phi.ty)?;
            if changed {
                trace!("  phi {} -> {}", phi.dest, ty);
                updates.reg_types.push((phi.dest, ty.clone()));
                updates.pending_phis.push(PendingPhi {
                    block: block_id,
                    index,
                    ty,
                });
            }
        }

        for (i, inst) in block.instructions.iter().enumerate() {
            let loc = (block_id, i);
            match inst {
                IrInstruction::Alloca { dest, ty, .. } => {
                    let (new_ty, changed) = inflated_type(map, ty)
                        .map_err(|e| with_context(e, inst))?;
                    if changed {
                        trace!("  {}", dump_instruction(inst));
                        updates.reg_types.push((*dest, new_ty.clone().ptr_to()));
                        updates.in_place.push(InstUpdate::Alloca { loc, ty: new_ty });
                    }
                }

                IrInstruction::GetElementPtr {
                    dest,
                    source_ty,
                    indices,
                    ..
                } => {
                    if let Some((new_source, new_indices, result_ty)) =
                        walk_gep(map, inst, source_ty, indices)?
                    {
                        trace!("  {}", dump_instruction(inst));
                        updates.reg_types.push((*dest, result_ty));
                        updates.in_place.push(InstUpdate::Gep {
                            loc,
                            source_ty: new_source,
                            indices: new_indices,
                        });
                    }
                }

                IrInstruction::BitCast { dest, src, to_ty } => {
                    let (new_to, changed) = inflated_type(map, to_ty)
                        .map_err(|e| with_context(e, inst))?;
                    if !changed {
                        continue;
                    }
                    trace!("  {}", dump_instruction(inst));

                    // An allocator call feeding a struct-pointer bitcast is
                    // a heap allocation of structs: rescale its size.
                    scan_alloc_link(
                        func,
                        map,
                        callee_names,
                        &const_defs,
                        &def_sites,
                        *src,
                        *dest,
                        to_ty,
                        &mut updates,
                    )?;

                    updates.reg_types.push((*dest, new_to.clone()));
                    updates
                        .in_place
                        .push(InstUpdate::BitCast { loc, to_ty: new_to });
                }

                IrInstruction::Load { dest, ty, .. } => {
                    let (new_ty, changed) = inflated_type(map, ty)
                        .map_err(|e| with_context(e, inst))?;
                    if changed {
                        trace!("  {}", dump_instruction(inst));
                        updates.reg_types.push((*dest, new_ty.clone()));
                        updates.in_place.push(InstUpdate::Load { loc, ty: new_ty });
                    }
                }

                IrInstruction::CallIndirect {
                    dest, signature, ..
                } => {
                    let (new_sig, changed) = inflated_type(map, signature)
                        .map_err(|e| with_context(e, inst))?;
                    if changed {
                        trace!("  {}", dump_instruction(inst));
                        if let (Some(dest), IrType::Function { return_type, .. }) =
                            (dest, &new_sig)
                        {
                            updates.reg_types.push((*dest, (**return_type).clone()));
                        }
                        updates.in_place.push(InstUpdate::IndirectSignature {
                            loc,
                            signature: new_sig,
                        });
                    }
                }

                // Direct calls need no rewrite of their own: callees were
                // redirected by the signature transformer, and a constant
                // function-pointer bitcast among the arguments is an
                // ordinary BitCast instruction here, already handled above.
                _ => {}
            }
        }
    }

    Ok(updates)
}

/// Attach the offending instruction to structural errors raised while
/// inflating one of its types.
fn with_context(err: TransformError, inst: &IrInstruction) -> TransformError {
    match err {
        TransformError::UnknownStruct { ty, .. } => TransformError::UnknownStruct {
            ty,
            context: dump_instruction(inst),
        },
        TransformError::OpaquePointer { .. } => TransformError::OpaquePointer {
            context: dump_instruction(inst),
        },
        other => other,
    }
}

/// Walk GEP indices left-to-right tracking the current type, replacing
/// struct member indices by their inflated positions. Returns `None` when
/// the instruction needs no rewrite.
#[allow(clippy::type_complexity)]
fn walk_gep(
    map: &StructMap,
    inst: &IrInstruction,
    source_ty: &IrType,
    indices: &[GepIndex],
) -> Result<Option<(IrType, Vec<GepIndex>, IrType)>, TransformError> {
    let mut cur = source_ty.clone().ptr_to();
    let mut new_indices = indices.to_vec();
    let mut replaced = false;

    for (k, idx) in indices.iter().enumerate() {
        cur = match cur {
            // Pointer and array strides keep their index; the walk moves to
            // the element type.
            IrType::Ptr(inner) => *inner,
            IrType::Array(elem, _) => *elem,
            // Struct member access: the index must be constant and is
            // remapped into the inflated layout.
            IrType::Struct(name) => {
                let info =
                    map.lookup_name(&name)
                        .ok_or_else(|| TransformError::UnknownStruct {
                            ty: format!("%{}", name),
                            context: dump_instruction(inst),
                        })?;
                if info.inflated_name == name {
                    // Already on the inflated layout; nothing to rewrite
                    return Ok(None);
                }
                match idx {
                    GepIndex::Const(i) => {
                        let field = usize::try_from(*i)
                            .ok()
                            .and_then(|i| info.fields.get(i))
                            .ok_or_else(|| TransformError::MalformedModule {
                                detail: format!(
                                    "member index {} out of range at: {}",
                                    i,
                                    dump_instruction(inst)
                                ),
                            })?;
                        new_indices[k] = GepIndex::Const(2 * *i + 1);
                        replaced = true;
                        field.ty.clone()
                    }
                    GepIndex::Reg(_) => {
                        return Err(TransformError::NonConstantStructIndex {
                            instruction: dump_instruction(inst),
                        })
                    }
                }
            }
            other => {
                return Err(TransformError::MalformedModule {
                    detail: format!(
                        "address walk reached non-aggregate {} at: {}",
                        other,
                        dump_instruction(inst)
                    ),
                })
            }
        };
    }

    let (new_source, source_changed) = inflated_type(map, source_ty)
        .map_err(|e| with_context(e, inst))?;
    if !source_changed && !replaced {
        return Ok(None);
    }
    let (final_ty, _) = inflated_type(map, &cur).map_err(|e| with_context(e, inst))?;
    Ok(Some((new_source, new_indices, final_ty.ptr_to())))
}

/// If the bitcast source is an allocator call, rescale its size argument
/// by the inflated/original size ratio and record the heap site.
#[allow(clippy::too_many_arguments)]
fn scan_alloc_link(
    func: &IrFunction,
    map: &StructMap,
    callee_names: &FxHashMap<IrFunctionId, String>,
    const_defs: &FxHashMap<IrId, IrValue>,
    def_sites: &FxHashMap<IrId, Loc>,
    src: IrId,
    dest: IrId,
    to_ty: &IrType,
    updates: &mut FunctionUpdates,
) -> Result<(), TransformError> {
    // Only a direct pointer-to-struct destination marks a struct heap block
    let info = match to_ty {
        IrType::Ptr(pointee) => match map.lookup(pointee) {
            Some(info)
                if !info.opaque
                    && pointee.struct_name() == Some(info.original_name.as_str()) =>
            {
                info.clone()
            }
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };

    let Some(&(block_id, index)) = def_sites.get(&src) else {
        return Ok(());
    };
    let def_inst = &func.cfg.blocks[&block_id].instructions[index];
    let IrInstruction::CallDirect { func_id, args, .. } = def_inst else {
        return Ok(());
    };
    let Some(arg_index) = callee_names
        .get(func_id)
        .and_then(|name| allocator_size_arg(name))
    else {
        return Ok(());
    };

    let size_reg = *args
        .get(arg_index)
        .ok_or_else(|| TransformError::MalformedModule {
            detail: format!("allocator call missing size argument: {}", dump_instruction(def_inst)),
        })?;
    let old_value = const_defs
        .get(&size_reg)
        .ok_or_else(|| TransformError::NonConstantAllocSize {
            instruction: dump_instruction(def_inst),
        })?;
    let old_size = old_value
        .as_uint()
        .ok_or_else(|| TransformError::NonConstantAllocSize {
            instruction: dump_instruction(def_inst),
        })?;

    if info.original_size == 0 {
        return Err(TransformError::MalformedModule {
            detail: format!(
                "heap allocation of zero-sized struct %{}",
                info.original_name
            ),
        });
    }

    // Recover the element count from the original size, then scale
    let count = old_size / info.original_size;
    let new_size = count * info.inflated_size;
    trace!(
        "  heap site for %{}: {} -> {} bytes ({} elements)",
        info.original_name,
        old_size,
        new_size,
        count
    );

    updates.size_args.push(SizeArgUpdate {
        loc: (block_id, index),
        arg_index,
        value: retype_int(old_value, new_size),
    });
    updates.heap_sites.push(HeapSite { ptr: dest, info, count });
    Ok(())
}

/// Rebuild an integer constant with the same width as `old`.
fn retype_int(old: &IrValue, value: u64) -> IrValue {
    match old {
        IrValue::I8(_) => IrValue::I8(value as i8),
        IrValue::I16(_) => IrValue::I16(value as i16),
        IrValue::I32(_) => IrValue::I32(value as i32),
        IrValue::I64(_) => IrValue::I64(value as i64),
        IrValue::U8(_) => IrValue::U8(value as u8),
        IrValue::U16(_) => IrValue::U16(value as u16),
        IrValue::U32(_) => IrValue::U32(value as u32),
        _ => IrValue::U64(value),
    }
}

fn value_type(value: &IrValue) -> IrType {
    match value {
        IrValue::I8(_) => IrType::I8,
        IrValue::I16(_) => IrType::I16,
        IrValue::I32(_) => IrType::I32,
        IrValue::I64(_) => IrType::I64,
        IrValue::U8(_) => IrType::U8,
        IrValue::U16(_) => IrType::U16,
        IrValue::U32(_) => IrType::U32,
        _ => IrType::U64,
    }
}

/// Drain the deferred queues into the function body.
fn apply_updates(func: &mut IrFunction, updates: FunctionUpdates) -> Vec<HeapSite> {
    // In-place type and index updates
    for update in updates.in_place {
        match update {
            InstUpdate::Alloca { loc, ty } => {
                if let IrInstruction::Alloca { ty: slot, .. } = inst_mut(func, loc) {
                    *slot = ty;
                }
            }
            InstUpdate::Gep {
                loc,
                source_ty,
                indices,
            } => {
                if let IrInstruction::GetElementPtr {
                    source_ty: src_slot,
                    indices: idx_slot,
                    ..
                } = inst_mut(func, loc)
                {
                    *src_slot = source_ty;
                    *idx_slot = indices;
                }
            }
            InstUpdate::BitCast { loc, to_ty } => {
                if let IrInstruction::BitCast { to_ty: slot, .. } = inst_mut(func, loc) {
                    *slot = to_ty;
                }
            }
            InstUpdate::Load { loc, ty } => {
                if let IrInstruction::Load { ty: slot, .. } = inst_mut(func, loc) {
                    *slot = ty;
                }
            }
            InstUpdate::IndirectSignature { loc, signature } => {
                if let IrInstruction::CallIndirect {
                    signature: slot, ..
                } = inst_mut(func, loc)
                {
                    *slot = signature;
                }
            }
        }
    }

    // Insert rescaled size constants immediately before their calls.
    // Within one block, applying in descending order keeps earlier
    // positions stable.
    let mut size_args = updates.size_args;
    size_args.sort_by(|a, b| (b.loc.0, b.loc.1).cmp(&(a.loc.0, a.loc.1)));
    for update in size_args {
        let reg = func.alloc_reg_typed(value_type(&update.value));
        let (block_id, index) = update.loc;
        let block = func.cfg.get_block_mut(block_id).expect("block disappeared");
        block.instructions.insert(
            index,
            IrInstruction::Const {
                dest: reg,
                value: update.value,
            },
        );
        if let IrInstruction::CallDirect { args, .. } = &mut block.instructions[index + 1] {
            args[update.arg_index] = reg;
        }
    }

    // Phi nodes last: they close cycles in the value graph, so they are
    // only materialized at the inflated type once every other rewrite of
    // the function is in place.
    for pending in updates.pending_phis {
        let block = func
            .cfg
            .get_block_mut(pending.block)
            .expect("block disappeared");
        block.phi_nodes[pending.index].ty = pending.ty;
    }

    for (reg, ty) in updates.reg_types {
        func.register_types.insert(reg, ty);
    }

    updates.heap_sites
}

fn inst_mut(func: &mut IrFunction, loc: Loc) -> &mut IrInstruction {
    &mut func
        .cfg
        .get_block_mut(loc.0)
        .expect("block disappeared")
        .instructions[loc.1]
}

//! Function signature transformation and boundary wrappers
//!
//! Every function whose signature mentions struct types is replaced by a
//! `<name>.inflated` twin so the module stays type-consistent after the
//! layout change:
//!
//! - **Defined** functions move their body into the twin; every call site
//!   and function reference is redirected first, so recursive calls land
//!   in the twin too. The original of `main` is kept as an emptied shell;
//!   other originals are deleted outright.
//! - **Declared** (external) functions get a twin stub whose body is
//!   synthesized later as an inflate→deflate wrapper: it materializes a
//!   contiguous original-layout copy of every struct-pointer argument,
//!   calls the external symbol, and writes the results back into the
//!   inflated layout so out-parameters propagate.
//! - `main`'s shell becomes the one deflate→inflate wrapper, letting the
//!   host invoke the program with its standard layout. Wrapping only
//!   `main` (rather than every exported function) preserves
//!   function-pointer identity.
//!
//! Struct-by-value across a wrapped boundary is unsupported and aborts.

use crate::error::TransformError;
use crate::inflate::inflated_type;
use crate::layout::{StructInfo, StructMap};
use ir::{
    FunctionKind, GepIndex, IrBlockId, IrControlFlowGraph, IrFunction, IrFunctionId,
    IrFunctionSignature, IrId, IrInstruction, IrModule, IrParameter, IrTerminator, IrType,
    IrValue, Linkage,
};
use log::{debug, info, trace};
use std::rc::Rc;

/// Wrapper work discovered while transforming signatures, synthesized
/// after the instruction rewriter has run.
pub struct WrapperPlan {
    /// (inflated stub, external original) pairs needing inflate→deflate
    /// wrapper bodies
    pub library_wrappers: Vec<(IrFunctionId, IrFunctionId)>,

    /// (original `main` shell, `main.inflated`) needing the one
    /// deflate→inflate wrapper
    pub entry_wrapper: Option<(IrFunctionId, IrFunctionId)>,
}

/// Replace every struct-mentioning function signature by its inflated
/// twin and redirect all call sites. Also retypes module globals.
pub fn transform_signatures(
    module: &mut IrModule,
    map: &StructMap,
) -> Result<WrapperPlan, TransformError> {
    let mut plan = WrapperPlan {
        library_wrappers: Vec::new(),
        entry_wrapper: None,
    };

    for fid in module.sorted_function_ids() {
        let func = &module.functions[&fid];
        if func.kind == FunctionKind::Intrinsic {
            continue;
        }
        let func_name = func.name.clone();

        let Some((param_tys, return_ty)) = inflated_signature(map, &func.signature)? else {
            trace!("{} skipped, no struct args/ret-value", func_name);
            continue;
        };

        let twin_id = module.alloc_function_id();
        debug!("{} gets inflated twin {}", func_name, twin_id);

        // Redirect before cloning so recursive calls inside the body
        // already target the twin when it is copied over.
        redirect_function(module, fid, twin_id);

        let func = module.functions.get_mut(&fid).unwrap();
        let mut twin = func.clone();
        twin.id = twin_id;
        twin.name = format!("{}{}", func_name, crate::INFLATED_SUFFIX);
        twin.linkage = Linkage::Internal;
        for (param, ty) in twin.signature.parameters.iter_mut().zip(&param_tys) {
            param.ty = ty.clone();
        }
        let param_regs: Vec<(IrId, IrType)> = twin
            .signature
            .parameters
            .iter()
            .map(|p| (p.reg, p.ty.clone()))
            .collect();
        for (reg, ty) in param_regs {
            twin.register_types.insert(reg, ty);
        }
        twin.signature.return_type = return_ty;

        // The original becomes an empty shell
        func.cfg = IrControlFlowGraph::new();
        func.register_types.clear();
        let shell_params: Vec<(IrId, IrType)> = func
            .signature
            .parameters
            .iter()
            .map(|p| (p.reg, p.ty.clone()))
            .collect();
        for (reg, ty) in shell_params {
            func.register_types.insert(reg, ty);
        }

        let is_entry = func_name == "main";
        module.add_function(twin);
        if is_entry {
            plan.entry_wrapper = Some((fid, twin_id));
        } else {
            module.functions.remove(&fid);
        }
    }

    let mut extern_ids: Vec<_> = module.extern_functions.keys().copied().collect();
    extern_ids.sort();
    for eid in extern_ids {
        let ext = module.extern_functions[&eid].clone();
        let Some((param_tys, return_ty)) = inflated_signature(map, &ext.signature)? else {
            continue;
        };

        let stub_id = module.alloc_function_id();
        let stub_name = format!("{}{}", ext.name, crate::INFLATED_SUFFIX);
        info!("library func {} gets wrapper stub {}", ext.name, stub_name);

        let parameters = ext
            .signature
            .parameters
            .iter()
            .zip(param_tys)
            .map(|(p, ty)| IrParameter {
                name: p.name.clone(),
                ty,
                reg: IrId::invalid(),
            })
            .collect();
        let mut stub = IrFunction::new(
            stub_id,
            stub_name,
            IrFunctionSignature {
                parameters,
                return_type: return_ty,
                varargs: ext.signature.varargs,
            },
        );
        stub.kind = FunctionKind::Wrapper;
        stub.linkage = Linkage::Internal;
        module.add_function(stub);

        redirect_function(module, eid, stub_id);
        plan.library_wrappers.push((stub_id, eid));
    }

    // Globals of struct type move to the inflated layout as well
    let mut global_ids: Vec<_> = module.globals.keys().copied().collect();
    global_ids.sort();
    for gid in global_ids {
        let ty = module.globals[&gid].ty.clone();
        let (new_ty, changed) = inflated_type(map, &ty)?;
        if changed {
            module.globals.get_mut(&gid).unwrap().ty = new_ty;
        }
    }

    Ok(plan)
}

/// Apply type inflation to a whole signature. `None` when it mentions no
/// struct types at all.
fn inflated_signature(
    map: &StructMap,
    signature: &IrFunctionSignature,
) -> Result<Option<(Vec<IrType>, IrType)>, TransformError> {
    let mut changed = false;
    let mut param_tys = Vec::with_capacity(signature.parameters.len());
    for param in &signature.parameters {
        let (ty, param_changed) = inflated_type(map, &param.ty)?;
        changed |= param_changed;
        param_tys.push(ty);
    }
    let (return_ty, ret_changed) = inflated_type(map, &signature.return_type)?;
    changed |= ret_changed;
    Ok(changed.then_some((param_tys, return_ty)))
}

/// Redirect every direct call and function reference from `from` to `to`.
fn redirect_function(module: &mut IrModule, from: IrFunctionId, to: IrFunctionId) {
    for func in module.functions.values_mut() {
        for block in func.cfg.blocks.values_mut() {
            for inst in &mut block.instructions {
                match inst {
                    IrInstruction::CallDirect { func_id, .. } if *func_id == from => {
                        *func_id = to;
                    }
                    IrInstruction::FunctionRef { func_id, .. } if *func_id == from => {
                        *func_id = to;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Synthesize the wrapper bodies recorded in `plan`. Runs after the
/// instruction rewriter so wrapper bodies are not themselves rewritten:
/// they intentionally mix both layouts.
pub fn synthesize_wrappers(
    module: &mut IrModule,
    map: &StructMap,
    plan: &WrapperPlan,
) -> Result<(), TransformError> {
    for &(stub_id, ext_id) in &plan.library_wrappers {
        let ext = module.extern_functions[&ext_id].clone();
        build_library_wrapper(module, map, stub_id, ext_id, &ext.name, &ext.signature)?;
    }

    if let Some((shell_id, twin_id)) = plan.entry_wrapper {
        build_entry_wrapper(module, map, shell_id, twin_id)?;
    }

    Ok(())
}

/// Direction of a field-by-field layout copy.
#[derive(Clone, Copy, PartialEq)]
enum CopyDir {
    /// Original layout → inflated layout
    Inflate,
    /// Inflated layout → original layout
    Deflate,
}

/// Instruction emitter appending to one block of a function under
/// construction.
struct Emit<'f> {
    func: &'f mut IrFunction,
    block: IrBlockId,
}

impl<'f> Emit<'f> {
    fn push(&mut self, inst: IrInstruction) {
        self.func
            .cfg
            .get_block_mut(self.block)
            .expect("wrapper block missing")
            .instructions
            .push(inst);
    }

    fn reg(&mut self, ty: IrType) -> IrId {
        self.func.alloc_reg_typed(ty)
    }

    fn const_u64(&mut self, value: u64) -> IrId {
        let dest = self.reg(IrType::U64);
        self.push(IrInstruction::Const {
            dest,
            value: IrValue::U64(value),
        });
        dest
    }

    fn alloca(&mut self, ty: IrType) -> IrId {
        let dest = self.reg(ty.clone().ptr_to());
        self.push(IrInstruction::Alloca {
            dest,
            ty,
            count: None,
        });
        dest
    }

    /// `&base[0].member`, with the result type supplied by the caller
    fn member_ptr(
        &mut self,
        base: IrId,
        struct_ty: IrType,
        member: usize,
        result_ty: IrType,
    ) -> IrId {
        let dest = self.reg(result_ty.ptr_to());
        self.push(IrInstruction::GetElementPtr {
            dest,
            ptr: base,
            source_ty: struct_ty,
            indices: vec![GepIndex::Const(0), GepIndex::Const(member as i64)],
        });
        dest
    }

    /// `&base[0][k]` for an array-typed pointee
    fn element_ptr(&mut self, base: IrId, array_ty: IrType, k: usize, elem_ty: IrType) -> IrId {
        let dest = self.reg(elem_ty.ptr_to());
        self.push(IrInstruction::GetElementPtr {
            dest,
            ptr: base,
            source_ty: array_ty,
            indices: vec![GepIndex::Const(0), GepIndex::Const(k as i64)],
        });
        dest
    }

    fn mem_copy(&mut self, dest: IrId, src: IrId, size: u64) {
        let size_reg = self.const_u64(size);
        self.push(IrInstruction::MemCopy {
            dest,
            src,
            size: size_reg,
        });
    }

    fn call(&mut self, func_id: IrFunctionId, args: Vec<IrId>, return_type: &IrType) -> Option<IrId> {
        let dest = if *return_type == IrType::Void {
            None
        } else {
            Some(self.reg(return_type.clone()))
        };
        self.push(IrInstruction::CallDirect {
            dest,
            func_id,
            args,
        });
        dest
    }

    fn ret(&mut self, value: Option<IrId>) {
        self.func
            .cfg
            .get_block_mut(self.block)
            .expect("wrapper block missing")
            .set_terminator(IrTerminator::Return { value });
    }
}

/// The type a member has on the given side of the copy. The original side
/// keeps `ty`; the inflated side renames struct references.
fn side_type(map: &StructMap, ty: &IrType, inflated_side: bool) -> Result<IrType, TransformError> {
    if inflated_side {
        Ok(inflated_type(map, ty)?.0)
    } else {
        Ok(ty.clone())
    }
}

/// Field-by-field copy between the two layouts of one struct. `src` and
/// `dst` point at whole-struct storage on their respective sides.
fn copy_fields(
    e: &mut Emit,
    map: &StructMap,
    info: &StructInfo,
    src: IrId,
    dst: IrId,
    dir: CopyDir,
) -> Result<(), TransformError> {
    let original = IrType::Struct(info.original_name.clone());
    let inflated = IrType::Struct(info.inflated_name.clone());
    let (src_struct, dst_struct) = match dir {
        CopyDir::Deflate => (inflated, original),
        CopyDir::Inflate => (original, inflated),
    };

    for (i, field) in info.fields.iter().enumerate() {
        let (src_idx, dst_idx) = match dir {
            CopyDir::Deflate => (info.offset_map[i], i),
            CopyDir::Inflate => (i, info.offset_map[i]),
        };
        let src_field_ty = side_type(map, &field.ty, dir == CopyDir::Deflate)?;
        let dst_field_ty = side_type(map, &field.ty, dir == CopyDir::Inflate)?;
        let src_ptr = e.member_ptr(src, src_struct.clone(), src_idx, src_field_ty);
        let dst_ptr = e.member_ptr(dst, dst_struct.clone(), dst_idx, dst_field_ty);

        if field.inner.is_some() {
            // Value-nested struct (possibly behind arrays): the layouts
            // differ inside, recurse member-wise
            copy_value(e, map, &field.ty, src_ptr, dst_ptr, dir)?;
        } else {
            // Leaf member: identical bytes on both sides (pointers are
            // copied bitwise)
            e.mem_copy(dst_ptr, src_ptr, field.size);
        }
    }
    Ok(())
}

/// Copy a value-nested member whose type contains a struct by value.
fn copy_value(
    e: &mut Emit,
    map: &StructMap,
    ty: &IrType,
    src: IrId,
    dst: IrId,
    dir: CopyDir,
) -> Result<(), TransformError> {
    match ty {
        IrType::Struct(name) => {
            let info = map
                .lookup_name(name)
                .ok_or_else(|| TransformError::UnknownStruct {
                    ty: format!("%{}", name),
                    context: "wrapper field copy".into(),
                })?
                .clone();
            copy_fields(e, map, &info, src, dst, dir)
        }
        IrType::Array(elem, count) => {
            let src_arr_ty = side_type(map, ty, dir == CopyDir::Deflate)?;
            let dst_arr_ty = side_type(map, ty, dir == CopyDir::Inflate)?;
            let src_elem_ty = side_type(map, elem, dir == CopyDir::Deflate)?;
            let dst_elem_ty = side_type(map, elem, dir == CopyDir::Inflate)?;
            for k in 0..*count {
                let src_k = e.element_ptr(src, src_arr_ty.clone(), k, src_elem_ty.clone());
                let dst_k = e.element_ptr(dst, dst_arr_ty.clone(), k, dst_elem_ty.clone());
                copy_value(e, map, elem, src_k, dst_k, dir)?;
            }
            Ok(())
        }
        other => Err(TransformError::MalformedModule {
            detail: format!("unexpected nested member type {} in wrapper copy", other),
        }),
    }
}

/// The struct layout record behind a single pointer layer, if this is a
/// pointer to a known non-opaque struct.
fn pointee_info<'m>(map: &'m StructMap, ty: &IrType) -> Option<&'m Rc<StructInfo>> {
    match ty {
        IrType::Ptr(pointee) => match map.lookup(pointee) {
            Some(info) if !info.opaque => Some(info),
            _ => None,
        },
        _ => None,
    }
}

/// Reject struct-by-value at a wrapped boundary.
fn reject_by_value(function: &str, ty: &IrType) -> Result<(), TransformError> {
    if ty.strip_arrays().is_struct() {
        return Err(TransformError::StructByValue {
            function: function.to_string(),
            ty: ty.to_string(),
        });
    }
    Ok(())
}

/// Body of the inflate→deflate wrapper around an external function.
fn build_library_wrapper(
    module: &mut IrModule,
    map: &StructMap,
    stub_id: IrFunctionId,
    ext_id: IrFunctionId,
    ext_name: &str,
    ext_signature: &IrFunctionSignature,
) -> Result<(), TransformError> {
    let func = module
        .functions
        .get_mut(&stub_id)
        .expect("wrapper stub missing");
    let params: Vec<IrParameter> = func.signature.parameters.clone();
    let stub_return = func.signature.return_type.clone();
    let entry = func.cfg.entry_block;
    let mut e = Emit { func, block: entry };

    let mut call_args = Vec::with_capacity(params.len());
    let mut writebacks: Vec<(Rc<StructInfo>, IrId, IrId)> = Vec::new();

    for param in &params {
        reject_by_value(ext_name, &param.ty)?;
        match pointee_info(map, &param.ty) {
            Some(info) => {
                let info = info.clone();
                // Contiguous original-layout copy for the callee
                let deflated = e.alloca(IrType::Struct(info.original_name.clone()));
                copy_fields(&mut e, map, &info, param.reg, deflated, CopyDir::Deflate)?;
                call_args.push(deflated);
                writebacks.push((info, deflated, param.reg));
            }
            None => call_args.push(param.reg),
        }
    }

    reject_by_value(ext_name, &ext_signature.return_type)?;
    let ret_val = e.call(ext_id, call_args, &ext_signature.return_type);

    // Propagate out-parameters back into the inflated layout
    for (info, deflated, inflated_arg) in writebacks {
        copy_fields(&mut e, map, &info, deflated, inflated_arg, CopyDir::Inflate)?;
    }

    match pointee_info(map, &stub_return) {
        Some(info) => {
            let info = info.clone();
            let inflated = e.alloca(IrType::Struct(info.inflated_name.clone()));
            let deflated_ret = ret_val.expect("pointer return without value");
            copy_fields(&mut e, map, &info, deflated_ret, inflated, CopyDir::Inflate)?;
            e.ret(Some(inflated));
        }
        None => e.ret(ret_val),
    }

    debug!("synthesized inflate/deflate wrapper for {}", ext_name);
    Ok(())
}

/// Body of the deflate→inflate wrapper in `main`'s original shell.
fn build_entry_wrapper(
    module: &mut IrModule,
    map: &StructMap,
    shell_id: IrFunctionId,
    twin_id: IrFunctionId,
) -> Result<(), TransformError> {
    let twin_return = module.functions[&twin_id].signature.return_type.clone();
    let func = module
        .functions
        .get_mut(&shell_id)
        .expect("entry shell missing");
    func.kind = FunctionKind::Wrapper;
    let params: Vec<IrParameter> = func.signature.parameters.clone();
    let shell_return = func.signature.return_type.clone();
    let entry = func.cfg.entry_block;
    let mut e = Emit { func, block: entry };

    let mut call_args = Vec::with_capacity(params.len());
    for param in &params {
        reject_by_value("main", &param.ty)?;
        match pointee_info(map, &param.ty) {
            Some(info) => {
                let info = info.clone();
                let inflated = e.alloca(IrType::Struct(info.inflated_name.clone()));
                copy_fields(&mut e, map, &info, param.reg, inflated, CopyDir::Inflate)?;
                call_args.push(inflated);
            }
            None => call_args.push(param.reg),
        }
    }

    reject_by_value("main", &shell_return)?;
    let ret_val = e.call(twin_id, call_args, &twin_return);

    match pointee_info(map, &shell_return) {
        Some(info) => {
            let info = info.clone();
            let deflated = e.alloca(IrType::Struct(info.original_name.clone()));
            let inflated_ret = ret_val.expect("pointer return without value");
            copy_fields(&mut e, map, &info, inflated_ret, deflated, CopyDir::Deflate)?;
            e.ret(Some(deflated));
        }
        None => e.ret(ret_val),
    }

    debug!("synthesized entry wrapper around main");
    Ok(())
}
